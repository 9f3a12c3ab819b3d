//! # Stage: Path Pattern Table
//!
//! ## Responsibility
//! Classify a repository path into a [`RiskLevel`] tier using glob patterns
//! compiled once into anchored regexes.
//!
//! ## Guarantees
//! - Most severe wins: buckets are checked `restricted → high → medium → low`
//!   and lookup stops at the first match.
//! - Deterministic: within a bucket, patterns are checked in declaration order,
//!   so the reported matching pattern is stable.
//! - Paths matching nothing get the table's `unmatched_tier`.
//! - Matching ignores ASCII case, so `Middleware.ts` and `.ENV` land in the
//!   same tier as their lowercase spellings.
//!
//! ## Glob syntax
//! `**/` matches zero or more leading directories, `**` matches anything,
//! `*` matches within one segment, `?` matches one non-separator character.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::self_modify::proposal::RiskLevel;

/// Raw glob lists per tier, as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSpec {
    pub restricted: Vec<String>,
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
    pub unmatched_tier: RiskLevel,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for PatternSpec {
    fn default() -> Self {
        Self {
            restricted: owned(&[
                "middleware.ts",
                "**/middleware.ts",
                ".env",
                ".env.*",
                "**/.env",
                "**/.env.*",
                "prisma/schema.prisma",
                "**/auth/**",
                "src/lib/safety/**",
                "src/lib/autonomy/**",
                ".github/workflows/**",
                "**/*.pem",
                "**/*.key",
            ]),
            high: owned(&[
                "src/lib/db.ts",
                "**/database/**",
                "package.json",
                "package-lock.json",
                "next.config.*",
                "**/*.sql",
                "vercel.json",
            ]),
            medium: owned(&[
                "app/api/**",
                "src/app/api/**",
                "src/lib/**",
                "lib/**",
                "**/*.config.*",
            ]),
            low: owned(&[
                "components/**",
                "src/components/**",
                "app/**",
                "src/app/**",
                "public/**",
                "**/*.md",
                "**/*.css",
                "**/*.test.ts",
                "**/*.test.tsx",
            ]),
            unmatched_tier: RiskLevel::Medium,
        }
    }
}

impl PatternSpec {
    fn bucket(&self, tier: RiskLevel) -> &[String] {
        match tier {
            RiskLevel::Restricted => &self.restricted,
            RiskLevel::High => &self.high,
            RiskLevel::Medium => &self.medium,
            RiskLevel::Low => &self.low,
        }
    }
}

/// Translate a glob into an anchored regex source string.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

#[derive(Debug)]
struct CompiledPattern {
    glob: String,
    regex: Regex,
}

/// A path's tier and the pattern that put it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMatch {
    pub tier: RiskLevel,
    /// `None` when the path matched nothing and got the unmatched tier.
    pub pattern: Option<String>,
}

/// Precompiled tier table.  Build once and share; lookups take `&self`.
#[derive(Debug)]
pub struct PatternTable {
    /// Indexed in [`RiskLevel::DESCENDING`] order.
    buckets: Vec<(RiskLevel, Vec<CompiledPattern>)>,
    unmatched_tier: RiskLevel,
}

impl PatternTable {
    /// Compile every glob in `spec`.
    ///
    /// # Errors
    /// `ConfigError::Pattern` for the first glob that does not compile, and
    /// `ConfigError::Invalid` if the unmatched tier is `restricted`.
    pub fn compile(spec: &PatternSpec) -> Result<Self, ConfigError> {
        if spec.unmatched_tier == RiskLevel::Restricted {
            return Err(ConfigError::Invalid(
                "unmatched_tier cannot be restricted".into(),
            ));
        }
        let mut buckets = Vec::with_capacity(4);
        for tier in RiskLevel::DESCENDING {
            let mut compiled = Vec::new();
            for glob in spec.bucket(tier) {
                let regex = RegexBuilder::new(&glob_to_regex(glob))
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ConfigError::Pattern { pattern: glob.clone(), source })?;
                compiled.push(CompiledPattern { glob: glob.clone(), regex });
            }
            buckets.push((tier, compiled));
        }
        Ok(Self { buckets, unmatched_tier: spec.unmatched_tier })
    }

    /// The built-in table.
    pub fn default_table() -> Result<Self, ConfigError> {
        Self::compile(&PatternSpec::default())
    }

    /// Classify a normalised path.
    pub fn classify(&self, path: &str) -> TierMatch {
        for (tier, patterns) in &self.buckets {
            if let Some(p) = patterns.iter().find(|p| p.regex.is_match(path)) {
                return TierMatch { tier: *tier, pattern: Some(p.glob.clone()) };
            }
        }
        TierMatch { tier: self.unmatched_tier, pattern: None }
    }

    pub fn tier_of(&self, path: &str) -> RiskLevel {
        self.classify(path).tier
    }

    pub fn pattern_count(&self) -> usize {
        self.buckets.iter().map(|(_, p)| p.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn table() -> PatternTable {
        PatternTable::default_table().unwrap()
    }

    #[test]
    fn test_glob_translation() {
        assert_eq!(glob_to_regex("*.md"), "^[^/]*\\.md$");
        assert_eq!(glob_to_regex("**/auth/**"), "^(?:.*/)?auth/.*$");
        assert_eq!(glob_to_regex("a?.ts"), "^a[^/]\\.ts$");
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let re = Regex::new(&glob_to_regex("next.config.*")).unwrap();
        assert!(re.is_match("next.config.js"));
        assert!(!re.is_match("next.config.d/x.js"));
    }

    #[test]
    fn test_double_star_slash_matches_root() {
        let re = Regex::new(&glob_to_regex("**/middleware.ts")).unwrap();
        assert!(re.is_match("middleware.ts"));
        assert!(re.is_match("src/middleware.ts"));
        assert!(!re.is_match("src/not_middleware.ts"));
    }

    #[rstest]
    #[case("middleware.ts", RiskLevel::Restricted)]
    #[case(".env", RiskLevel::Restricted)]
    #[case(".env.local", RiskLevel::Restricted)]
    #[case("prisma/schema.prisma", RiskLevel::Restricted)]
    #[case("app/api/auth/route.ts", RiskLevel::Restricted)]
    #[case("src/lib/safety/ethics.ts", RiskLevel::Restricted)]
    #[case("src/lib/db.ts", RiskLevel::High)]
    #[case("package.json", RiskLevel::High)]
    #[case("migrations/001.sql", RiskLevel::High)]
    #[case("app/api/chat/route.ts", RiskLevel::Medium)]
    #[case("src/lib/utils.ts", RiskLevel::Medium)]
    #[case("components/Button.tsx", RiskLevel::Low)]
    #[case("README.md", RiskLevel::Low)]
    #[case("app/page.tsx", RiskLevel::Low)]
    #[case("scripts/deploy.sh", RiskLevel::Medium)]
    #[case("Middleware.ts", RiskLevel::Restricted)]
    #[case(".ENV", RiskLevel::Restricted)]
    #[case("SRC/lib/Safety/x.ts", RiskLevel::Restricted)]
    #[case("app/API/Auth/route.ts", RiskLevel::Restricted)]
    #[case("Package.JSON", RiskLevel::High)]
    fn test_default_tiers(#[case] path: &str, #[case] expected: RiskLevel) {
        assert_eq!(table().tier_of(path), expected, "path {}", path);
    }

    #[test]
    fn test_most_severe_bucket_wins() {
        // app/** is low, app/api/** is medium, **/auth/** is restricted.
        let m = table().classify("app/api/auth/login.ts");
        assert_eq!(m.tier, RiskLevel::Restricted);
        assert_eq!(m.pattern.as_deref(), Some("**/auth/**"));
    }

    #[test]
    fn test_case_variant_reports_declared_pattern() {
        let m = table().classify("PRISMA/Schema.prisma");
        assert_eq!(m.tier, RiskLevel::Restricted);
        assert_eq!(m.pattern.as_deref(), Some("prisma/schema.prisma"));
    }

    #[test]
    fn test_unmatched_reports_no_pattern() {
        let m = table().classify("tools/gen.rs");
        assert_eq!(m.tier, RiskLevel::Medium);
        assert!(m.pattern.is_none());
    }

    #[test]
    fn test_custom_unmatched_tier() {
        let spec = PatternSpec { unmatched_tier: RiskLevel::Low, ..PatternSpec::default() };
        let t = PatternTable::compile(&spec).unwrap();
        assert_eq!(t.tier_of("tools/gen.rs"), RiskLevel::Low);
    }

    #[test]
    fn test_unmatched_restricted_rejected() {
        let spec = PatternSpec { unmatched_tier: RiskLevel::Restricted, ..PatternSpec::default() };
        assert!(matches!(PatternTable::compile(&spec), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_pattern_count_covers_every_bucket() {
        let spec = PatternSpec::default();
        let total = spec.restricted.len() + spec.high.len() + spec.medium.len() + spec.low.len();
        assert_eq!(table().pattern_count(), total);
    }
}
