use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Lee una variable de entorno y la parsea; si falta o no parsea, `default`.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Duración en milisegundos.
pub fn env_millis(key: &str, default: Duration) -> Duration {
    env_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// `Duration` como milisegundos en serde: `#[serde(with = "common::config::millis")]`.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_garbage_falls_back_to_default() {
        assert_eq!(env_parse("COMMON_CONFIG_TEST_SURELY_UNSET", 7u32), 7);

        env::set_var("COMMON_CONFIG_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("COMMON_CONFIG_TEST_GARBAGE", 3u16), 3);

        env::set_var("COMMON_CONFIG_TEST_MILLIS", " 250 ");
        assert_eq!(
            env_millis("COMMON_CONFIG_TEST_MILLIS", Duration::ZERO),
            Duration::from_millis(250)
        );
    }
}
