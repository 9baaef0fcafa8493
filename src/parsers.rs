//! Text parsers for device output: connection banners, `pm` listings
//! and `getprop` dumps.

use std::collections::HashMap;

/// Parse a CNXN banner payload such as
/// `device::ro.product.name=x;ro.product.model=y;ro.serialno=Z\0`.
///
/// NUL bytes are stripped first. The part before the first `"::"` is
/// returned as the banner kind; the tail is split on `';'`, each entry
/// on `'='`, keeping the first two trimmed components.
pub fn parse_banner(payload: &[u8]) -> (String, HashMap<String, String>) {
    let text: String = String::from_utf8_lossy(payload)
        .chars()
        .filter(|&c| c != '\0')
        .collect();

    let (kind, tail) = match text.split_once("::") {
        Some((kind, tail)) => (kind.to_string(), tail),
        None => (text.clone(), ""),
    };

    let mut properties = HashMap::new();
    for entry in tail.split(';') {
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        if !key.is_empty() {
            properties.insert(key.to_string(), value.to_string());
        }
    }

    (kind, properties)
}

/// Parse `pm list packages` output (`package:com.example.app` lines)
/// into a sorted list of package ids.
pub fn parse_package_list(output: &str) -> Vec<String> {
    let mut packages: Vec<String> = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    packages.sort();
    packages
}

/// Parse one `getprop` output line of the form `[key]: [value]`.
pub fn parse_property_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if !line.starts_with('[') {
        return None;
    }

    let (key, value) = line.split_once("]: [")?;
    let key = key.trim_start_matches('[').to_string();
    let value = value.trim_end_matches(']').to_string();
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_with_properties() {
        let payload = b"device::ro.product.name=x;ro.product.model=y;ro.serialno=Z\0";
        let (kind, props) = parse_banner(payload);
        assert_eq!(kind, "device");
        assert_eq!(props.get("ro.product.name").map(String::as_str), Some("x"));
        assert_eq!(props.get("ro.product.model").map(String::as_str), Some("y"));
        assert_eq!(props.get("ro.serialno").map(String::as_str), Some("Z"));
    }

    #[test]
    fn banner_without_properties() {
        let (kind, props) = parse_banner(b"host::");
        assert_eq!(kind, "host");
        assert!(props.is_empty());
    }

    #[test]
    fn banner_value_with_equals() {
        let (_, props) = parse_banner(b"device::features=a=b");
        assert_eq!(props.get("features").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn package_list() {
        let output = "package:com.b.app\npackage:com.a.app\n\njunk line\npackage:\n";
        assert_eq!(parse_package_list(output), vec!["com.a.app", "com.b.app"]);
    }

    #[test]
    fn property_line() {
        assert_eq!(
            parse_property_line("[ro.serialno]: [ABC123]"),
            Some(("ro.serialno".into(), "ABC123".into()))
        );
        assert_eq!(parse_property_line("not a property"), None);
    }
}
