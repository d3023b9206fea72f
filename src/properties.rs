use k8s_openapi::api::core::v1::Secret;

/// Looks up `key` in a Java-style properties document.
///
/// Only `key=value` and `key: value` lines are understood; comments and
/// blank lines are skipped. The last assignment wins.
pub fn get<'a>(document: &'a str, key: &str) -> Option<&'a str> {
    document
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
        .filter_map(|l| {
            let idx = l.find(['=', ':'])?;
            Some((l[..idx].trim(), l[idx + 1..].trim()))
        })
        .filter(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .last()
}

/// Text of the data entry `file` in `secret`, if present and valid UTF-8.
pub fn file(secret: &Secret, file: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(file))
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
}
