// Serde deserializers for counts written with thousand separators
// Lets users write `skip_statements: 10,000` in YAML

use serde::{Deserialize, Deserializer};

fn strip_separators(s: &str) -> String {
    s.chars().filter(|c| !matches!(c, ',' | '_' | ' ')).collect()
}

/// Deserialize usize with optional thousand separators
/// Examples: "193", "1,234", "331_776"
pub fn deserialize_count<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;

    match value {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .and_then(|u| usize::try_from(u).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("Expected a non-negative count, got {}", n))),
        serde_yaml::Value::String(s) => strip_separators(&s)
            .parse::<usize>()
            .map_err(|e| serde::de::Error::custom(format!("Invalid count: {} (from '{}')", e, s))),
        _ => Err(serde::de::Error::custom("Expected number or string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Skip {
        #[serde(default, deserialize_with = "deserialize_count")]
        value: usize,
    }

    #[test]
    fn test_plain_and_separated() {
        let plain: Skip = serde_yaml::from_str("value: 193").unwrap();
        assert_eq!(plain.value, 193);
        let commas: Skip = serde_yaml::from_str("value: \"10,000\"").unwrap();
        assert_eq!(commas.value, 10_000);
        let underscores: Skip = serde_yaml::from_str("value: \"331_776\"").unwrap();
        assert_eq!(underscores.value, 331_776);
    }

    #[test]
    fn test_missing_defaults_to_zero() {
        let skip: Skip = serde_yaml::from_str("{}").unwrap();
        assert_eq!(skip.value, 0);
    }

    #[test]
    fn test_negative_rejected() {
        assert!(serde_yaml::from_str::<Skip>("value: -3").is_err());
    }
}
