/// Load structure from TOML file.
pub fn from_toml<T: serde::de::DeserializeOwned>(
    path: impl AsRef<std::path::Path>,
) -> std::io::Result<T> {
    use std::io::Read;

    let mut contents = String::new();
    std::fs::File::open(path)?.read_to_string(&mut contents)?;

    toml::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Stack-wide tunables.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Maximum number of entries in an endpoint receive filter list.
    pub filter_max: usize,
    /// Depth of each endpoint's datagram receive queue.
    pub recv_queue_depth: usize,
    /// Depth of each endpoint's error-notification queue.
    pub errqueue_depth: usize,
    /// Whether endpoints may claim send priorities below 2.
    pub admin: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            filter_max: 512,
            recv_queue_depth: 32,
            errqueue_depth: 16,
            admin: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = StackConfig::default();

        assert_eq!(config.filter_max, 512);
        assert!(!config.admin);
    }

    #[test]
    fn config_partial_toml() {
        let config: StackConfig = toml::from_str("filter_max = 16\nadmin = true").unwrap();

        assert_eq!(config.filter_max, 16);
        assert!(config.admin);
        assert_eq!(config.recv_queue_depth, StackConfig::default().recv_queue_depth);
    }
}
