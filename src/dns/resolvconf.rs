// Copyright Podlink Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::IpAddr;
use std::path::Path;

/// The parts of a host resolver file that interception cares about: the
/// configured nameservers and the search list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResolveFile {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
}

impl ResolveFile {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&tokio::fs::read_to_string(path).await?))
    }

    pub fn parse(content: &str) -> Self {
        let mut rf = ResolveFile::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(Ok(ip)) = fields.next().map(str::parse) {
                        rf.nameservers.push(ip);
                    }
                }
                // Later search/domain lines replace earlier ones, like libc.
                Some("search") => rf.search = fields.map(str::to_owned).collect(),
                Some("domain") => {
                    if let Some(domain) = fields.next() {
                        rf.search = vec![domain.to_owned()];
                    }
                }
                _ => {}
            }
        }
        rf
    }

    /// The nameserver that will act as the upstream resolver, when present.
    pub fn first_nameserver(&self) -> Option<IpAddr> {
        self.nameservers.first().copied()
    }

    /// The search entries, normalized into drop-suffix form. The host
    /// inherited these from an unrelated environment, so queries carrying
    /// them must be stripped before they are sent to the cluster.
    pub fn drop_suffixes(&self) -> Vec<String> {
        self.search
            .iter()
            .filter_map(|s| normalize_suffix(s))
            .collect()
    }
}

/// Normalizes a search entry: lower-cased, no leading dot, exactly one
/// trailing dot. Empty entries normalize to `None`.
pub fn normalize_suffix(entry: &str) -> Option<String> {
    let entry = entry.trim().trim_start_matches('.');
    if entry.is_empty() {
        return None;
    }
    let mut entry = entry.to_ascii_lowercase();
    if !entry.ends_with('.') {
        entry.push('.');
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_typical_file() {
        let rf = ResolveFile::parse(
            "# Generated by NetworkManager\n\
             search corp.example branch.example\n\
             nameserver 10.96.0.10\n\
             nameserver 8.8.8.8\n\
             options ndots:5\n",
        );
        assert_eq!(
            vec![
                "10.96.0.10".parse::<IpAddr>().unwrap(),
                "8.8.8.8".parse().unwrap()
            ],
            rf.nameservers
        );
        assert_eq!(vec!["corp.example", "branch.example"], rf.search);
        assert_eq!(Some("10.96.0.10".parse().unwrap()), rf.first_nameserver());
    }

    #[test]
    fn parse_no_nameserver() {
        let rf = ResolveFile::parse("search corp.example\n");
        assert_eq!(None, rf.first_nameserver());
    }

    #[test]
    fn parse_domain_directive() {
        let rf = ResolveFile::parse("domain corp.example\nnameserver 1.1.1.1\n");
        assert_eq!(vec!["corp.example"], rf.search);
    }

    #[test]
    fn parse_skips_malformed_nameserver() {
        let rf = ResolveFile::parse("nameserver not-an-ip\nnameserver 1.1.1.1\n");
        assert_eq!(vec!["1.1.1.1".parse::<IpAddr>().unwrap()], rf.nameservers);
    }

    #[test]
    fn suffix_normalization() {
        struct Case {
            entry: &'static str,
            expected: Option<&'static str>,
        }
        let cases = [
            Case {
                entry: "corp.example",
                expected: Some("corp.example."),
            },
            Case {
                entry: ".corp.example",
                expected: Some("corp.example."),
            },
            Case {
                entry: "Corp.Example.",
                expected: Some("corp.example."),
            },
            Case {
                entry: ".",
                expected: None,
            },
            Case {
                entry: "",
                expected: None,
            },
        ];
        for c in cases {
            assert_eq!(
                c.expected.map(str::to_owned),
                normalize_suffix(c.entry),
                "entry: {:?}",
                c.entry
            );
        }
    }

    #[test]
    fn drop_suffixes_from_search() {
        let rf = ResolveFile::parse("search Corp.Example .other.example\nnameserver 1.1.1.1\n");
        assert_eq!(vec!["corp.example.", "other.example."], rf.drop_suffixes());
    }
}
