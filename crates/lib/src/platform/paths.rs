use crate::consts::{APP_NAME, STATE_DIR_ENV};
use std::path::PathBuf;

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE").map(PathBuf::from).unwrap_or_default()
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_default()
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  let appdata = std::env::var("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join("AppData").join("Roaming"));
  appdata.join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the root directory holding one state directory per session.
///
/// `DOCKYARD_STATE_DIR` takes precedence over the platform data directory.
pub fn state_root() -> PathBuf {
  if let Ok(dir) = std::env::var(STATE_DIR_ENV)
    && !dir.is_empty()
  {
    return PathBuf::from(dir);
  }
  data_dir().join("state")
}

#[cfg(test)]
#[cfg(not(windows))]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn xdg_data_home_takes_precedence() {
    temp_env::with_vars(
      [
        ("XDG_DATA_HOME", Some("/custom/data")),
        ("HOME", Some("/home/user")),
        (STATE_DIR_ENV, None),
      ],
      || {
        assert_eq!(data_dir(), PathBuf::from("/custom/data").join(APP_NAME));
        assert_eq!(state_root(), PathBuf::from("/custom/data").join(APP_NAME).join("state"));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_fallback_to_home_directories() {
    temp_env::with_vars(
      [("XDG_DATA_HOME", None::<&str>), ("HOME", Some("/home/user"))],
      || {
        assert_eq!(data_dir(), PathBuf::from("/home/user/.local/share").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn state_dir_env_overrides_data_dir() {
    temp_env::with_vars(
      [(STATE_DIR_ENV, Some("/tmp/dockyard-state")), ("XDG_DATA_HOME", Some("/custom/data"))],
      || {
        assert_eq!(state_root(), PathBuf::from("/tmp/dockyard-state"));
      },
    );
  }

  #[test]
  #[serial]
  fn empty_state_dir_env_is_ignored() {
    temp_env::with_vars(
      [(STATE_DIR_ENV, Some("")), ("XDG_DATA_HOME", Some("/custom/data"))],
      || {
        assert_eq!(state_root(), PathBuf::from("/custom/data").join(APP_NAME).join("state"));
      },
    );
  }
}
