//! Types for use when configuring the netfetch coordinators.

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> NfResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| NfError::other_src("encode", e))?,
    )
    .map_err(|e| NfError::other_src("decode", e))
}

/// Denotes a type used to configure a specific coordinator.
///
/// Module configs are loaded from a file that humans may edit, so
/// implementors should tolerate missing properties (`#[serde(default)]`).
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

/// Netfetch configuration, a map from module name to module config.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// Add the default config of a module. Used when generating a
    /// default configuration file. Fails if the module name is taken.
    pub fn add_default_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
    ) -> NfResult<()> {
        if self.0.contains_key(&module_name) {
            return Err(NfError::other(format!(
                "Refusing to overwrite conflicting module name: {module_name}"
            )));
        }
        self.0.insert(module_name, tc(&M::default())?);
        Ok(())
    }

    /// Replace the config of a module.
    pub fn set_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
        config: &M,
    ) -> NfResult<()> {
        self.0.insert(module_name, tc(config)?);
        Ok(())
    }

    /// Extract a module config. Unset modules get their default.
    pub fn get_module_config<M: ModConfig>(
        &self,
        module_name: &str,
    ) -> NfResult<M> {
        self.0
            .get(module_name)
            .map(tc)
            .unwrap_or_else(|| Ok(M::default()))
    }
}
