mod backoff;
mod bus;

pub(crate) mod utils {
    use crate::framework::*;
    use netfetch_api::BoxFut;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub enum TestReason {
        Failed,
        Preempted,
        Cancelled,
    }

    #[derive(Debug)]
    pub enum Behavior {
        Finish,
        Fail,
        Panic,
        Block(Arc<tokio::sync::Semaphore>),
    }

    #[derive(Debug)]
    pub struct TestOp {
        pub key: &'static str,
        pub priority: i64,
        pub behavior: Behavior,
    }

    impl TestOp {
        pub fn new(key: &'static str, behavior: Behavior) -> Self {
            Self {
                key,
                priority: 0,
                behavior,
            }
        }

        pub fn with_priority(mut self, priority: i64) -> Self {
            self.priority = priority;
            self
        }
    }

    impl Operation for TestOp {
        type Output = &'static str;
        type Reason = TestReason;

        fn key(&self) -> OperationKey {
            OperationKey::from_parts([self.key])
        }

        fn execute(&self) -> BoxFut<'_, Result<&'static str, TestReason>> {
            Box::pin(async move {
                match &self.behavior {
                    Behavior::Finish => Ok(self.key),
                    Behavior::Fail => Err(TestReason::Failed),
                    Behavior::Panic => panic!("test op panic"),
                    Behavior::Block(gate) => {
                        let _permit = gate.acquire().await.unwrap();
                        Ok(self.key)
                    }
                }
            })
        }
    }

    impl PrioritizedOperation for TestOp {
        fn priority(&self) -> i64 {
            self.priority
        }

        fn preempted_reason() -> TestReason {
            TestReason::Preempted
        }
    }

    pub fn gate() -> Arc<tokio::sync::Semaphore> {
        Arc::new(tokio::sync::Semaphore::new(0))
    }

    pub async fn next_outcome(
        recv: &mut OutcomeRecv<TestOp>,
    ) -> (&'static str, Outcome<TestOp>) {
        let c = tokio::time::timeout(Duration::from_secs(5), recv.recv())
            .await
            .expect("timed out waiting for an outcome")
            .expect("outcome channel closed");
        (c.op.key, c.outcome)
    }
}
