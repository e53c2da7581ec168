//! Parsing config text into key/value trees and rendering them back.
use serde_json::Value;

use super::prototype::FileType;

/// Parse `text` as `file_type` into a tree.
///
/// # Errors
///
/// Returns the parser message if the text is not valid for the format, or if
/// `file_type` is [`FileType::Text`].
pub fn parse(file_type: FileType, text: &str) -> Result<Value, String> {
    match file_type {
        FileType::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        FileType::Yaml => {
            if text.trim().is_empty() {
                return Ok(Value::Object(serde_json::Map::new()));
            }
            serde_yaml::from_str(text).map_err(|e| e.to_string())
        }
        FileType::Toml => toml::from_str(text).map_err(|e| e.to_string()),
        FileType::Text => Err("plain text has no key/value structure".to_string()),
    }
}

/// Render a tree as `file_type`.
///
/// # Errors
///
/// Returns the serializer message if the tree cannot be expressed in the
/// format (e.g. a `null` in TOML), or if `file_type` is [`FileType::Text`].
pub fn render(file_type: FileType, value: &Value) -> Result<Vec<u8>, String> {
    match file_type {
        FileType::Json => {
            let mut out = serde_json::to_vec_pretty(value).map_err(|e| e.to_string())?;
            out.push(b'\n');
            Ok(out)
        }
        FileType::Yaml => serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| e.to_string()),
        FileType::Toml => toml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| e.to_string()),
        FileType::Text => Err("plain text has no key/value structure".to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_each_format_to_same_tree() {
        let expected = json!({"server": {"port": 8080, "host": "localhost"}});
        let from_json = parse(FileType::Json, r#"{"server":{"port":8080,"host":"localhost"}}"#).unwrap();
        let from_yaml = parse(FileType::Yaml, "server:\n  port: 8080\n  host: localhost\n").unwrap();
        let from_toml = parse(FileType::Toml, "[server]\nport = 8080\nhost = \"localhost\"\n").unwrap();
        assert_eq!(from_json, expected);
        assert_eq!(from_yaml, expected);
        assert_eq!(from_toml, expected);
    }

    #[test]
    fn empty_yaml_is_empty_tree() {
        assert_eq!(parse(FileType::Yaml, "").unwrap(), json!({}));
    }

    #[test]
    fn invalid_json_reports_message() {
        assert!(parse(FileType::Json, "{").is_err());
    }

    #[test]
    fn text_is_not_parsed() {
        assert!(parse(FileType::Text, "a=b").is_err());
    }

    #[test]
    fn render_toml_reparses() {
        let value = json!({"a": 1, "table": {"b": "c"}});
        let rendered = render(FileType::Toml, &value).unwrap();
        let text = String::from_utf8(rendered).unwrap();
        assert_eq!(parse(FileType::Toml, &text).unwrap(), value);
    }

    #[test]
    fn render_json_is_pretty_with_newline() {
        let rendered = render(FileType::Json, &json!({"a": 1})).unwrap();
        assert_eq!(String::from_utf8(rendered).unwrap(), "{\n  \"a\": 1\n}\n");
    }

    #[test]
    fn render_toml_rejects_null() {
        assert!(render(FileType::Toml, &json!({"a": null})).is_err());
    }
}
