use std::env::temp_dir;
use std::fs::read_to_string;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

pub const DEFAULT_READ_CHUNK_SIZE: usize = 4 * 1_024;
pub const DEFAULT_COMMAND_BUFFER: usize = 32;
pub const DEFAULT_MAX_INBOUND_BUFFER: usize = 16 * 1_024 * 1_024;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "snake_case")]
#[non_exhaustive]
pub struct TubesConfig {
    /// Where listening Unix sockets are created.
    pub socket_dir: Utf8PathBuf,
    /// Upper bound on a single read from a local socket.
    pub read_chunk_size: usize,
    pub command_buffer: usize,
    /// Most bytes held for one bytestream while its local socket is not
    /// draining. A peer that sends past it loses the stream.
    pub max_inbound_buffer: usize,
}

impl TubesConfig {
    #[must_use]
    pub fn new(socket_dir: Utf8PathBuf) -> Self {
        Self {
            socket_dir,
            ..Self::default()
        }
    }

    pub fn load(path: &Utf8Path) -> EyreResult<Self> {
        let content = read_to_string(path)
            .wrap_err_with(|| format!("failed to read tubes configuration from {path:?}"))?;

        toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse tubes configuration in {path:?}"))
    }
}

impl Default for TubesConfig {
    fn default() -> Self {
        let socket_dir = Utf8PathBuf::from_path_buf(temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));

        Self {
            socket_dir,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            max_inbound_buffer: DEFAULT_MAX_INBOUND_BUFFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = TempDir::new("tubes-config").unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("tubes.toml")).unwrap();

        write(&path, "socket_dir = \"/run/lanlink\"\nread_chunk_size = 512\n").unwrap();

        let config = TubesConfig::load(&path).unwrap();

        assert_eq!(config.socket_dir, "/run/lanlink");
        assert_eq!(config.read_chunk_size, 512);
        assert_eq!(config.command_buffer, DEFAULT_COMMAND_BUFFER);
        assert_eq!(config.max_inbound_buffer, DEFAULT_MAX_INBOUND_BUFFER);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new("tubes-config").unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("absent.toml")).unwrap();

        let err = TubesConfig::load(&path).unwrap_err();

        assert!(err.to_string().contains("failed to read"), "{err}");
    }

    #[test]
    fn test_load_rejects_wrong_types() {
        let dir = TempDir::new("tubes-config").unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("tubes.toml")).unwrap();

        write(&path, "read_chunk_size = \"big\"\n").unwrap();

        let _ignored = TubesConfig::load(&path).unwrap_err();
    }
}
