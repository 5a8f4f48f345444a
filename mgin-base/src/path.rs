// Colon-joined path helpers shared by the store, index engine, query engine,
// and pub/sub fan-out. A path's first segment is the top-level key
// (collection); its second, when present, is the entity id.

pub fn split(path: &str) -> Vec<&str> {
    path.split(':').filter(|s| !s.is_empty()).collect()
}

pub fn join(segments: &[&str]) -> String {
    segments.join(":")
}

pub fn join_owned(segments: &[String]) -> String {
    segments.join(":")
}

pub fn top_level(path: &str) -> Option<&str> {
    split(path).first().copied()
}

pub fn entity_id(full_entity_path: &str) -> String {
    // "<top-level>:<entity id>" as used to key index buckets.
    full_entity_path.to_string()
}

pub fn parent(path: &str) -> Option<String> {
    let segs = split(path);
    if segs.len() <= 1 {
        None
    } else {
        Some(join(&segs[..segs.len() - 1]))
    }
}

pub fn last(path: &str) -> Option<&str> {
    split(path).last().copied()
}

pub fn is_wildcard_segment(seg: &str) -> bool {
    seg == "*"
}

pub fn contains_wildcard(path: &str) -> bool {
    split(path).iter().any(|s| is_wildcard_segment(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_join_roundtrip() {
        let segs = split("user:1:name");
        assert_eq!(segs, vec!["user", "1", "name"]);
        assert_eq!(join(&segs), "user:1:name");
    }

    #[test]
    fn parent_and_last() {
        assert_eq!(parent("user:1:name"), Some("user:1".to_string()));
        assert_eq!(last("user:1:name"), Some("name"));
        assert_eq!(parent("user"), None);
    }

    #[test]
    fn wildcard_detection() {
        assert!(contains_wildcard("user:*:name"));
        assert!(!contains_wildcard("user:1:name"));
    }
}
