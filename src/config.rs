#[derive(Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    #[serde(rename = "dry-run", default = "false_")]
    pub dry_run: bool,
    #[serde(rename = "add-metadata", default = "false_")]
    pub add_metadata: bool,
    #[serde(rename = "commit-interval", default = "default_commit_interval")]
    pub commit_interval: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dry_run: false,
            add_metadata: false,
            commit_interval: default_commit_interval(),
        }
    }
}

#[inline(always)]
fn false_() -> bool {
    false
}

#[inline(always)]
fn default_commit_interval() -> u32 {
    10000
}

#[cfg(test)]
mod test {
    use super::Options;

    #[test]
    fn test_defaults() {
        let options: Options = toml::from_str("").unwrap();
        assert!(!options.dry_run);
        assert!(!options.add_metadata);
        assert_eq!(options.commit_interval, 10000);
    }

    #[test]
    fn test_full() {
        let options: Options = toml::from_str(
            "dry-run = true\nadd-metadata = true\ncommit-interval = 25\n",
        )
        .unwrap();
        assert!(options.dry_run);
        assert!(options.add_metadata);
        assert_eq!(options.commit_interval, 25);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Options>("frobnicate = 1\n").is_err());
    }
}
