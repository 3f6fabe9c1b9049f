#[derive(Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoRule {
    pub name: String,
    #[serde(default = "Vec::new")]
    pub branches: Vec<String>,
    #[serde(rename = "forward-to")]
    pub forward_to: Option<String>,
    #[serde(default = "String::new")]
    pub prefix: String,
}

#[cfg(test)]
mod test {
    use super::RepoRule;

    #[test]
    fn test_parse_minimal() {
        let rule: RepoRule = toml::from_str("name = \"project\"\n").unwrap();
        assert_eq!(rule.name, "project");
        assert!(rule.branches.is_empty());
        assert!(rule.forward_to.is_none());
        assert!(rule.prefix.is_empty());
    }

    #[test]
    fn test_parse_forwarding() {
        let rule: RepoRule = toml::from_str(
            "name = \"project/sub\"\nbranches = [\"master\", \"stable\"]\nforward-to = \"project\"\nprefix = \"sub/\"\n",
        )
        .unwrap();
        assert_eq!(rule.name, "project/sub");
        assert_eq!(rule.branches, ["master", "stable"]);
        assert_eq!(rule.forward_to.as_deref(), Some("project"));
        assert_eq!(rule.prefix, "sub/");
    }
}
