use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug,Error)]
pub enum SettingsError {
    #[error("cannot access settings file {path}: {source}")]
    Io { path:String, #[source] source:std::io::Error },
    #[error("settings file is corrupt: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// toml-backed settings files. implementors pick a file extension so
/// different settings can live next to each other in a work directory
pub trait ConfigFile: Serialize + DeserializeOwned {

    fn file_ext() -> String;

    fn to_file(&self,filename:&Path) -> Result<(),SettingsError> {
        let p = filename.with_extension(Self::file_ext());
        let t = toml::to_string_pretty(self)?;
        let mut f = File::create(&p).map_err(|e| SettingsError::Io {
            path: p.display().to_string(),
            source: e,
        })?;
        f.write_all(t.as_bytes()).map_err(|e| SettingsError::Io {
            path: p.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn from_file(filename:&Path) -> Result<Self,SettingsError> {
        let p = filename.with_extension(Self::file_ext());
        let mut f = File::open(&p).map_err(|e| SettingsError::Io {
            path: p.display().to_string(),
            source: e,
        })?;
        let mut s = String::new();
        f.read_to_string(&mut s).map_err(|e| SettingsError::Io {
            path: p.display().to_string(),
            source: e,
        })?;
        Ok(toml::from_str(&s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize,Deserialize,PartialEq,Debug)]
    struct Dummy {
        iterations:u32,
        label:String,
    }

    impl ConfigFile for Dummy {
        fn file_ext() -> String {
            String::from("dummy_settings")
        }
    }

    #[test]
    fn round_trip() {
        let d = Dummy { iterations: 12, label: String::from("x") };
        let dir = std::env::temp_dir();
        let base = dir.join("mr_protocol_settings_test");
        d.to_file(&base).unwrap();
        let e = Dummy::from_file(&base).unwrap();
        assert_eq!(d,e);
        std::fs::remove_file(base.with_extension(Dummy::file_ext())).unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let r = Dummy::from_file(Path::new("/nonexistent/nowhere"));
        assert!(matches!(r,Err(SettingsError::Io { .. })));
    }
}
