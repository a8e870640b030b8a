//! Best-effort device and platform facts for the upload header. Nothing
//! here can fail; unknown values are reported as "unknown" or omitted.

/// Facts about the host device included in every upload header.
#[derive(Clone, Debug)]
pub struct DeviceFacts {
    pub manufacturer: String,
    pub platform: String,
    pub model: String,
    pub os_version: String,
    pub available_memory: Option<u64>,
    pub jailbroken: bool,
    pub locale_language: String,
    pub locale_country: String,
}

impl Default for DeviceFacts {
    fn default() -> Self {
        Self {
            manufacturer: "unknown".to_string(),
            platform: std::env::consts::OS.to_string(),
            model: "unknown".to_string(),
            os_version: "unknown".to_string(),
            available_memory: None,
            jailbroken: false,
            locale_language: String::new(),
            locale_country: String::new(),
        }
    }
}

impl DeviceFacts {
    /// Gather what the host environment exposes. Locale comes from LANG
    /// (e.g. "en_US.UTF-8"); everything unavailable stays at its default.
    pub fn collect() -> Self {
        let mut facts = Self::default();
        if let Ok(lang) = std::env::var("LANG") {
            let lang = lang.split('.').next().unwrap_or("");
            let mut parts = lang.splitn(2, '_');
            if let Some(language) = parts.next() {
                facts.locale_language = language.to_string();
            }
            if let Some(country) = parts.next() {
                facts.locale_country = country.to_string();
            }
        }
        facts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_benign() {
        let facts = DeviceFacts::default();
        assert_eq!(facts.manufacturer, "unknown");
        assert!(!facts.jailbroken);
        assert!(facts.available_memory.is_none());
    }

    #[test]
    fn collect_never_panics() {
        let facts = DeviceFacts::collect();
        assert!(!facts.platform.is_empty());
    }
}
