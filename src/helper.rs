use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::{Error, Result};

const SA_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

static LABEL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("static regex")
});

fn read_namespace_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path).map_err(Error::IoError)?;
    let ns = raw.trim();
    if ns.is_empty() {
        return Err(Error::InvalidConfig(format!("{} is empty", path.display())));
    }
    Ok(ns.to_string())
}

/// Namespace the operator runs in: `OPERATOR_NAMESPACE` wins over the service account file
pub fn get_my_namespace() -> Result<String> {
    match std::env::var("OPERATOR_NAMESPACE") {
        Ok(ns) if !ns.is_empty() => Ok(ns),
        _ => read_namespace_file(Path::new(SA_NAMESPACE_FILE)),
    }
}

/// Whether `value` may be used as a label value
pub fn is_valid_label(value: &str) -> bool {
    value.is_empty() || (value.len() <= 63 && LABEL_VALUE.is_match(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn namespace_file_is_trimmed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "kubevirt").unwrap();
        assert_eq!(read_namespace_file(f.path()).unwrap(), "kubevirt");
    }

    #[test]
    fn empty_namespace_file_is_rejected() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(read_namespace_file(f.path()), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn label_values() {
        assert!(is_valid_label(""));
        assert!(is_valid_label("v1.2.3"));
        assert!(is_valid_label("kubevirt_x-y"));
        assert!(!is_valid_label("-bad"));
        assert!(!is_valid_label("has space"));
        assert!(!is_valid_label(&"a".repeat(64)));
    }
}
