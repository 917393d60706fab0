//! Reshaping of plain `Key : Value` reports into JSON

use std::collections::BTreeMap;

use log::warn;

const TIME_SUFFIX: &str = "/Time";

/// Parse a plain report into field name / value pairs
///
/// Lines without a colon are skipped. Field names lose their spaces, and a
/// name such as `FileModificationDate/Time` collapses to
/// `FileModificationDate`.
pub fn parse(report: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();

    for line in report.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let mut key: String = key.trim().chars().filter(|c| *c != ' ').collect();
        if key.contains('/') && key.ends_with(TIME_SUFFIX) {
            key.truncate(key.len() - TIME_SUFFIX.len());
        }
        fields.insert(key, value.trim().to_string());
    }

    let source_file = join_path(
        fields.get("Directory").map(String::as_str).unwrap_or_default(),
        fields.get("FileName").map(String::as_str).unwrap_or_default(),
    );
    fields.insert("SourceFile".to_string(), source_file);

    fields
}

/// Reshape a plain report into a JSON object
///
/// Serialization failure yields an empty string rather than an error. A map
/// of strings always serializes, so this is a fallback that should never
/// trigger, but callers must treat `""` as "no report".
pub fn reshape(report: &str) -> String {
    match serde_json::to_string(&parse(report)) {
        Ok(json) => json,
        Err(e) => {
            warn!("Dropping report that failed to serialize: {}", e);
            String::new()
        }
    }
}

fn join_path(dir: &str, file: &str) -> String {
    match (dir.is_empty(), file.is_empty()) {
        (true, _) => file.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{}/{}", dir.trim_end_matches('/'), file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_source_file_synthesized() {
        let json = reshape("Directory: /tmp\nFileName: a.jpg\n");
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["SourceFile"], "/tmp/a.jpg");
        assert_eq!(value["Directory"], "/tmp");
        assert!(json.contains("\"SourceFile\":\"/tmp/a.jpg\""));
    }

    #[test]
    fn test_field_names_normalized() {
        let fields = parse(
            "File Modification Date/Time     : 2024:01:02 03:04:05+00:00\n\
             Image Size                      : 640x480\n\
             Date/Time Original              : 2023:12:31 23:59:59\n",
        );
        assert_eq!(fields["FileModificationDate"], "2024:01:02 03:04:05+00:00");
        assert_eq!(fields["ImageSize"], "640x480");
        // only a trailing "/Time" collapses
        assert_eq!(fields["Date/TimeOriginal"], "2023:12:31 23:59:59");
    }

    #[test]
    fn test_noise_lines_skipped() {
        let fields = parse("\n   \nno colon here\nMIME Type: image/jpeg\n");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["MIMEType"], "image/jpeg");
        assert_eq!(fields["SourceFile"], "");
    }

    #[test]
    fn test_partial_location() {
        assert_eq!(parse("FileName: a.jpg")["SourceFile"], "a.jpg");
        assert_eq!(parse("Directory: /tmp")["SourceFile"], "/tmp");
        assert_eq!(join_path("/tmp/", "a.jpg"), "/tmp/a.jpg");
    }
}
