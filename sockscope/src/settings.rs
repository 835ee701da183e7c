use std::{collections::HashMap, fmt::Display, marker::PhantomData, path::Path, str::FromStr};

use anyhow::{Result, bail};
use config::{Config, ConfigError, Environment, File};
use serde::{
    Deserialize, Deserializer,
    de::{self, SeqAccess, Visitor},
};
use sockscope_common::{EventKind, KernelOffsets, LibsetConfig, SockField};

/// Which hooks get attached.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Probes {
    pub shared_libraries: Option<bool>,
    pub sockfd: Option<bool>,
    pub connect: Option<bool>,
    pub bind: Option<bool>,
}

/// Library sets reported by the shared-library probe.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Libsets {
    pub crypto: Option<bool>,
    pub gpu: Option<bool>,
}

/// Kernel structure offsets, keyed by field name (see `SockField::name`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Offsets {
    /// Start from the common x86_64 layout before applying `fields`.
    pub builtin_defaults: Option<bool>,
    pub sk_protocol_size: Option<u32>,
    #[serde(default)]
    pub fields: HashMap<String, u64>,
}

/// Processes whose socket operations are flagged as activity-dump samples.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ActivityDump {
    #[serde(default, deserialize_with = "deserialize_list")]
    pub pids: Vec<u32>,
    #[serde(default, deserialize_with = "deserialize_list")]
    pub events: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Output {
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub probes: Probes,
    #[serde(default)]
    pub libsets: Libsets,
    #[serde(default)]
    pub offsets: Offsets,
    #[serde(default)]
    pub activity_dump: ActivityDump,
    #[serde(default)]
    pub output: Output,
}

impl Settings {
    /// Layers an optional settings file under the environment
    /// (`PROBES__SOCKFD=true`, `ACTIVITY_DUMP__PIDS=10,20`, ...).
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }
        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("activity_dump.pids")
                    .with_list_parse_key("activity_dump.events")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn json_output(&self) -> bool {
        self.output.json.unwrap_or(false)
    }

    pub fn to_libset_config(&self) -> LibsetConfig {
        LibsetConfig::new(
            self.libsets.crypto.unwrap_or(true),
            self.libsets.gpu.unwrap_or(false),
        )
    }

    pub fn to_kernel_offsets(&self) -> Result<KernelOffsets> {
        let mut offsets = if self.offsets.builtin_defaults.unwrap_or(true) {
            KernelOffsets::typical_x86_64()
        } else {
            KernelOffsets::UNKNOWN
        };

        for (name, offset) in &self.offsets.fields {
            let Some(field) = SockField::from_name(name) else {
                bail!("Unknown kernel field offset: {}", name);
            };
            offsets.set(field, *offset);
        }

        offsets.sk_protocol_size = match self.offsets.sk_protocol_size.unwrap_or(2) {
            size @ (1 | 2) => size,
            other => bail!("sk_protocol_size must be 1 or 2, got {}", other),
        };
        Ok(offsets)
    }

    /// Bit mask of sampled event kinds. No list means every socket operation.
    pub fn activity_dump_mask(&self) -> Result<u64> {
        if self.activity_dump.events.is_empty() {
            return Ok(EventKind::Connect.mask() | EventKind::Bind.mask());
        }
        let mut mask = 0;
        for name in &self.activity_dump.events {
            match EventKind::from_name(name) {
                Some(kind) => mask |= kind.mask(),
                None => bail!("Unknown activity dump event: {}", name),
            }
        }
        Ok(mask)
    }
}

/// Accepts a YAML sequence, a comma-separated string or a lone scalar.
fn deserialize_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    struct ListVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for ListVisitor<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        type Value = Vec<T>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a list or a comma-separated string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().map_err(E::custom))
                .collect()
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            self.visit_str(&v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            self.visit_str(&v.to_string())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                items.push(item.trim().parse().map_err(de::Error::custom)?);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ListVisitor(PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use sockscope_common::sock::OFFSET_UNKNOWN;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("PROBES__SOCKFD", "true");
            std::env::set_var("LIBSETS__GPU", "true");
            std::env::set_var("ACTIVITY_DUMP__PIDS", "10,20");
            std::env::set_var("ACTIVITY_DUMP__EVENTS", "connect");
        }

        let settings = Settings::new(None).expect("Failed to load settings");

        assert_eq!(settings.probes.sockfd, Some(true));
        assert_eq!(settings.libsets.gpu, Some(true));
        assert_eq!(settings.activity_dump.pids, vec![10, 20]);
        assert_eq!(settings.activity_dump.events, vec!["connect".to_string()]);

        unsafe {
            std::env::remove_var("PROBES__SOCKFD");
            std::env::remove_var("LIBSETS__GPU");
            std::env::remove_var("ACTIVITY_DUMP__PIDS");
            std::env::remove_var("ACTIVITY_DUMP__EVENTS");
        }
    }

    #[test]
    #[serial]
    fn test_single_pid_from_env() {
        unsafe {
            std::env::set_var("ACTIVITY_DUMP__PIDS", "4242");
        }

        let settings = Settings::new(None).expect("Failed to load settings");
        assert_eq!(settings.activity_dump.pids, vec![4242]);

        unsafe {
            std::env::remove_var("ACTIVITY_DUMP__PIDS");
        }
    }

    #[test]
    #[serial]
    fn test_load_yaml_file() {
        let path = std::env::temp_dir().join(format!("sockscope-settings-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "probes:\n  shared_libraries: true\n  connect: false\noffsets:\n  sk_protocol_size: 1\n  fields:\n    sock_sk_protocol: 513\nactivity_dump:\n  pids: [7, 8]\n",
        )
        .unwrap();

        let settings = Settings::new(Some(&path)).expect("Failed to load settings");
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.probes.shared_libraries, Some(true));
        assert_eq!(settings.probes.connect, Some(false));
        assert_eq!(settings.activity_dump.pids, vec![7, 8]);

        let offsets = settings.to_kernel_offsets().unwrap();
        assert_eq!(offsets.get(SockField::SkProtocol), Some(513));
        assert_eq!(offsets.sk_protocol_size, 1);
    }

    #[test]
    fn test_to_libset_config_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.to_libset_config(), LibsetConfig::new(true, false));
        assert!(!settings.json_output());
    }

    #[test]
    fn test_to_kernel_offsets() {
        let mut settings = Settings::default();
        settings.offsets.builtin_defaults = Some(false);
        settings.offsets.fields.insert("sock_common_skc_dport".to_string(), 12);

        let offsets = settings.to_kernel_offsets().unwrap();
        assert_eq!(offsets.get(SockField::SkcDport), Some(12));
        assert_eq!(offsets.get(SockField::SkcNum), None);
        assert_eq!(offsets.offsets[SockField::SocketSk as usize], OFFSET_UNKNOWN);

        settings.offsets.fields.insert("bogus".to_string(), 1);
        assert!(settings.to_kernel_offsets().is_err());
    }

    #[test]
    fn test_rejects_bad_protocol_width() {
        let mut settings = Settings::default();
        settings.offsets.sk_protocol_size = Some(4);
        assert!(settings.to_kernel_offsets().is_err());
    }

    #[test]
    fn test_activity_dump_mask() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.activity_dump_mask().unwrap(),
            EventKind::Connect.mask() | EventKind::Bind.mask()
        );

        settings.activity_dump.events = vec!["bind".to_string()];
        assert_eq!(settings.activity_dump_mask().unwrap(), EventKind::Bind.mask());

        settings.activity_dump.events = vec!["exec".to_string()];
        assert!(settings.activity_dump_mask().is_err());
    }
}
