use std::collections::BTreeSet;

/// Extract the module name from a missing-module failure
/// (`ModuleNotFoundError: No module named 'requests'`).
pub fn extract_missing_module(text: &str) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    let marker = "no module named";
    let start = lowered.find(marker)? + marker.len();
    let tail = &lowered[start..];
    let name: String = tail
        .chars()
        .skip_while(|ch| ch.is_whitespace() || *ch == '\'' || *ch == '"')
        .take_while(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
        .collect();
    if name.is_empty() {
        return None;
    }
    // `No module named 'pkg.sub'` installs the top-level distribution.
    Some(name.split('.').next().unwrap_or(&name).to_string())
}

/// Bounds auto-installation within one action: each distinct module is
/// installed at most once, and no more than `max_modules` distinct modules
/// may be attempted, so an install/fail loop cannot run unbounded.
#[derive(Debug)]
pub struct InstallGovernor {
    enabled: bool,
    max_modules: u32,
    attempted: BTreeSet<String>,
}

impl InstallGovernor {
    pub fn new(enabled: bool, max_modules: u32) -> Self {
        Self {
            enabled,
            max_modules,
            attempted: BTreeSet::new(),
        }
    }

    pub fn approve(&mut self, module: &str) -> bool {
        if !self.enabled || module.trim().is_empty() {
            return false;
        }
        if self.attempted.contains(module) {
            return false;
        }
        if self.attempted.len() as u32 >= self.max_modules {
            return false;
        }
        self.attempted.insert(module.to_string());
        true
    }

    pub fn attempted_count(&self) -> usize {
        self.attempted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_module_names() {
        assert_eq!(
            extract_missing_module("ModuleNotFoundError: No module named 'requests'"),
            Some("requests".to_string())
        );
        assert_eq!(
            extract_missing_module("No module named \"pandas.core\""),
            Some("pandas".to_string())
        );
        assert_eq!(extract_missing_module("SyntaxError: invalid syntax"), None);
    }

    #[test]
    fn governor_caps_distinct_modules() {
        let mut governor = InstallGovernor::new(true, 2);
        assert!(governor.approve("requests"));
        assert!(!governor.approve("requests"));
        assert!(governor.approve("pandas"));
        assert!(!governor.approve("numpy"));
        assert_eq!(governor.attempted_count(), 2);
    }

    #[test]
    fn governor_disabled_rejects_everything() {
        let mut governor = InstallGovernor::new(false, 6);
        assert!(!governor.approve("requests"));
    }
}
