//! The identity daemon's `himmelblau.conf`.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityConfig {
    pub domain: String,
    /// Put directory users in `wheel` as well as `users`.
    pub grant_sudo: bool,
    pub debug: bool,
    pub apply_policy: bool,
}

impl IdentityConfig {
    /// Settings used at enrollment time.
    pub fn for_enrollment(domain: &str, grant_sudo: bool) -> Self {
        Self {
            domain: domain.trim().to_string(),
            grant_sudo,
            debug: true,
            apply_policy: true,
        }
    }

    pub fn local_groups(&self) -> &'static str {
        if self.grant_sudo {
            "users,wheel"
        } else {
            "users"
        }
    }

    pub fn render(&self) -> String {
        format!(
            "[global]
# EntraID domain
domains = {domain}

# Local groups for EntraID users
local_groups = {groups}

# Home directory attributes
home_attr = CN
home_alias = CN

# Use /etc/skel for new home directories
use_etc_skel = true

# Disable Hello PIN (use MFA)
enable_hello = false

# Enable debug logging
debug = {debug}

# Enable Intune MDM compliance
apply_policy = {apply_policy}
",
            domain = self.domain,
            groups = self.local_groups(),
            debug = self.debug,
            apply_policy = self.apply_policy,
        )
    }

    /// Read back the fields we manage. `None` when no domain is set.
    pub fn parse(text: &str) -> Option<Self> {
        let mut config = Self {
            domain: String::new(),
            grant_sudo: false,
            debug: false,
            apply_policy: false,
        };
        for line in text.lines().map(str::trim) {
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "domains" => config.domain = value.to_string(),
                "local_groups" => config.grant_sudo = value.contains("wheel"),
                "debug" => config.debug = value.eq_ignore_ascii_case("true"),
                "apply_policy" => config.apply_policy = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        (!config.domain.is_empty()).then_some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_enrollment_config() {
        let text = IdentityConfig::for_enrollment("contoso.com", true).render();
        assert!(text.starts_with("[global]\n# EntraID domain\ndomains = contoso.com\n"));
        assert!(text.contains("\nlocal_groups = users,wheel\n"));
        assert!(text.contains("\nhome_attr = CN\nhome_alias = CN\n"));
        assert!(text.contains("\nenable_hello = false\n"));
        assert!(text.contains("\ndebug = true\n"));
        assert!(text.contains("\napply_policy = true\n"));
    }

    #[test]
    fn test_without_sudo() {
        let text = IdentityConfig::for_enrollment("contoso.com", false).render();
        assert!(text.contains("\nlocal_groups = users\n"));
    }

    #[test]
    fn test_parse_reads_back_render() {
        let config = IdentityConfig {
            domain: "fabrikam.onmicrosoft.com".into(),
            grant_sudo: false,
            debug: false,
            apply_policy: true,
        };
        assert_eq!(IdentityConfig::parse(&config.render()), Some(config));
    }

    #[test]
    fn test_parse_ignores_comments_and_needs_domain() {
        assert_eq!(IdentityConfig::parse("# domains = x\n[global]\n"), None);
        let parsed = IdentityConfig::parse("domains=a.com\nDEBUG = 1\ndebug = TRUE\n").unwrap();
        assert!(parsed.debug);
        assert_eq!(parsed.domain, "a.com");
    }
}
