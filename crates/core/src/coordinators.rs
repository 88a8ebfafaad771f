//! The coordinators, one per network workflow.
//!
//! Each coordinator owns its queues, an outcome task matching every cancel
//! reason to a disposition, and the bus subscriptions that resume parked
//! operations.

pub mod delete;
pub mod download_attachment;
pub mod download_messages;
pub mod extended_payload;
pub mod free_trial;
pub mod push_registration;
pub mod server_query;
pub mod server_session;
pub mod signed_url_refresh;
pub mod transfer_relay;
pub mod turn_credentials;
pub mod user_data;
pub mod web_socket;
pub mod well_known;
