//! Remote path patterns.
//!
//! A pattern is a directory plus a mask for the last component. The mask
//! may use `*` (any run of characters) and `?` (one character); a mask
//! without wildcards names a single entry.

/// A split remote pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePattern {
    /// Directory to list.
    pub dir: String,

    /// Mask applied to entry names.
    pub mask: String,
}

impl RemotePattern {
    /// Split `"/tmp/logs/*"` into `"/tmp/logs"` and `"*"`.
    ///
    /// A trailing slash selects the whole directory.
    pub fn parse(pattern: &str) -> Self {
        if let Some(dir) = pattern.strip_suffix('/') {
            return Self {
                dir: non_empty_dir(dir),
                mask: "*".to_string(),
            };
        }
        match pattern.rfind('/') {
            Some(pos) => Self {
                dir: non_empty_dir(&pattern[..pos]),
                mask: pattern[pos + 1..].to_string(),
            },
            None => Self {
                dir: ".".to_string(),
                mask: pattern.to_string(),
            },
        }
    }

    /// Whether the mask contains wildcards.
    pub fn is_wildcard(&self) -> bool {
        self.mask.contains(['*', '?'])
    }

    /// Whether an entry name matches the mask.
    pub fn matches(&self, name: &str) -> bool {
        wildcard_match(&self.mask, name)
    }

    /// Full remote path of an entry in this pattern's directory.
    pub fn entry_path(&self, name: &str) -> String {
        join_remote(&self.dir, name)
    }
}

fn non_empty_dir(dir: &str) -> String {
    if dir.is_empty() {
        "/".to_string()
    } else {
        dir.to_string()
    }
}

/// Join a remote directory and an entry name with exactly one slash.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Match `name` against a mask using `*` and `?`.
pub fn wildcard_match(mask: &str, name: &str) -> bool {
    let mask: Vec<char> = mask.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut m, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if m < mask.len() && (mask[m] == '?' || mask[m] == name[n]) {
            m += 1;
            n += 1;
        } else if m < mask.len() && mask[m] == '*' {
            star = Some((m, n));
            m += 1;
        } else if let Some((star_m, star_n)) = star {
            // Let the last star swallow one more character.
            m = star_m + 1;
            n = star_n + 1;
            star = Some((star_m, star_n + 1));
        } else {
            return false;
        }
    }

    mask[m..].iter().all(|c| *c == '*')
}
