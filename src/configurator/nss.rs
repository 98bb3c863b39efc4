//! Name-service switch edits.

pub const NSS_MARKER: &str = "himmelblau";
pub const PASSWD_LINE: &str = "passwd: files systemd himmelblau";
pub const GROUP_LINE: &str = "group: files [SUCCESS=merge] systemd himmelblau";

/// New `nsswitch.conf` content, or `None` when the module is already wired in.
///
/// Only lines beginning with `passwd:` or `group:` are replaced, with fixed
/// text. Everything else, including line endings, is left alone.
pub fn rewrite_nsswitch(content: &str) -> Option<String> {
    if content.contains(NSS_MARKER) {
        return None;
    }
    let rewritten = content
        .split('\n')
        .map(|line| {
            if line.starts_with("passwd:") {
                PASSWD_LINE
            } else if line.starts_with("group:") {
                GROUP_LINE
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOCK: &str = "# Name Service Switch\n\
passwd: files systemd\n\
group: files [SUCCESS=merge] systemd\n\
shadow: files systemd\n\
hosts: mymachines resolve [!UNAVAIL=return] files myhostname dns\n";

    #[test]
    fn test_rewrites_passwd_and_group_only() {
        let out = rewrite_nsswitch(STOCK).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "passwd: files systemd himmelblau");
        assert_eq!(lines[2], "group: files [SUCCESS=merge] systemd himmelblau");
        assert_eq!(lines[3], "shadow: files systemd");
        assert!(out.ends_with('\n'));
        assert_eq!(out.lines().count(), STOCK.lines().count());
    }

    #[test]
    fn test_marker_means_no_change() {
        assert_eq!(rewrite_nsswitch("passwd: files himmelblau\n"), None);
    }

    #[test]
    fn test_indented_or_missing_lines_are_not_invented() {
        let out = rewrite_nsswitch("  passwd: files\nhosts: dns\n").unwrap();
        assert_eq!(out, "  passwd: files\nhosts: dns\n");
        assert_eq!(rewrite_nsswitch("").unwrap(), "");
    }
}
