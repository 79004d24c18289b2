//! Relevance rules applied to every fetched opportunity.
//!
//! Rules run in a fixed order and the first failing rule decides the
//! rejection reason. Evaluation is pure: the same opportunity and `today`
//! always produce the same decision.

use chrono::NaiveDate;
use fsbot_core::Opportunity;
use regex::Regex;

use crate::config::FilterSettings;

pub const NO_INCLUDE_MATCH: &str = "no-include-match";
pub const FUNDER_NOT_WHITELISTED: &str = "funder-not-whitelisted";
pub const TYPE_NOT_WHITELISTED: &str = "type-not-whitelisted";
pub const DEADLINE_TOO_SOON: &str = "deadline-too-soon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept { reason: String },
    Reject { reason: String },
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accept { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            FilterDecision::Accept { reason } | FilterDecision::Reject { reason } => reason,
        }
    }
}

/// A configured keyword and its compiled matcher. Matching ignores case,
/// tolerates any run of whitespace between words and only hits on
/// alphanumeric word boundaries.
#[derive(Debug, Clone)]
pub struct Keyword {
    pub text: String,
    pattern: Regex,
}

impl Keyword {
    fn compile(raw: &str) -> Result<Option<Self>, regex::Error> {
        let words: Vec<String> = raw.split_whitespace().map(regex::escape).collect();
        if words.is_empty() {
            return Ok(None);
        }
        let pattern = Regex::new(&format!(
            r"(?i)(?:^|[^A-Za-z0-9]){}(?:[^A-Za-z0-9]|$)",
            words.join(r"\s+")
        ))?;
        Ok(Some(Self {
            text: raw.trim().to_string(),
            pattern,
        }))
    }

    fn is_match(&self, haystack: &str) -> bool {
        self.pattern.is_match(haystack)
    }
}

fn compile_all(raw: &[String]) -> Result<Vec<Keyword>, regex::Error> {
    let mut keywords = Vec::with_capacity(raw.len());
    for value in raw {
        if let Some(keyword) = Keyword::compile(value)? {
            keywords.push(keyword);
        }
    }
    Ok(keywords)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistField {
    Funder,
    FundingType,
}

impl WhitelistField {
    fn value(self, opportunity: &Opportunity) -> Option<&str> {
        match self {
            WhitelistField::Funder => opportunity.funder.as_deref(),
            WhitelistField::FundingType => opportunity.funding_type.as_deref(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            WhitelistField::Funder => "funder",
            WhitelistField::FundingType => "funding type",
        }
    }

    fn rejection(self) -> &'static str {
        match self {
            WhitelistField::Funder => FUNDER_NOT_WHITELISTED,
            WhitelistField::FundingType => TYPE_NOT_WHITELISTED,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Rule {
    IncludeKeywords(Vec<Keyword>),
    ExcludeKeywords(Vec<Keyword>),
    Whitelist {
        field: WhitelistField,
        allowed: Vec<String>,
    },
    MinDeadlineDays(i64),
}

enum Outcome {
    Pass(Option<String>),
    Fail(String),
}

/// A whitelisted value matches the whole field or one of its comma-separated
/// parts, ignoring case ("EPSRC, BBSRC" is a member of [bbsrc]).
fn is_member(value: &str, allowed: &[String]) -> bool {
    let value = value.trim();
    let mut candidates = std::iter::once(value).chain(value.split(',').map(str::trim));
    candidates.any(|candidate| {
        !candidate.is_empty()
            && allowed
                .iter()
                .any(|entry| entry.trim().eq_ignore_ascii_case(candidate))
    })
}

fn apply_rule(rule: &Rule, opportunity: &Opportunity, today: NaiveDate) -> Outcome {
    let searchable = || format!("{}\n{}", opportunity.title, opportunity.summary);
    match rule {
        Rule::IncludeKeywords(keywords) => {
            if keywords.is_empty() {
                return Outcome::Pass(None);
            }
            let text = searchable();
            let hits: Vec<&str> = keywords
                .iter()
                .filter(|kw| kw.is_match(&text))
                .map(|kw| kw.text.as_str())
                .collect();
            if hits.is_empty() {
                Outcome::Fail(NO_INCLUDE_MATCH.to_string())
            } else {
                Outcome::Pass(Some(format!("keywords: {}", hits.join(", "))))
            }
        }
        Rule::ExcludeKeywords(keywords) => {
            let text = searchable();
            match keywords.iter().find(|kw| kw.is_match(&text)) {
                Some(kw) => Outcome::Fail(format!("exclude-match:{}", kw.text)),
                None => Outcome::Pass(None),
            }
        }
        Rule::Whitelist { field, allowed } => {
            if allowed.is_empty() {
                return Outcome::Pass(None);
            }
            match field.value(opportunity) {
                Some(value) if is_member(value, allowed) => {
                    Outcome::Pass(Some(format!("{}: {}", field.label(), value.trim())))
                }
                _ => Outcome::Fail(field.rejection().to_string()),
            }
        }
        Rule::MinDeadlineDays(minimum) => match opportunity.deadline {
            None => Outcome::Pass(None),
            Some(deadline) => {
                let days = (deadline - today).num_days();
                if days < *minimum {
                    Outcome::Fail(DEADLINE_TOO_SOON.to_string())
                } else {
                    Outcome::Pass(Some(format!("deadline in {days} days")))
                }
            }
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    rules: Vec<Rule>,
}

impl FilterEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Build the ordered chain from configuration, leaving out rules that
    /// have nothing configured.
    pub fn from_settings(settings: &FilterSettings) -> Result<Self, regex::Error> {
        let mut rules = Vec::new();
        let include = compile_all(&settings.include_keywords)?;
        if !include.is_empty() {
            rules.push(Rule::IncludeKeywords(include));
        }
        let exclude = compile_all(&settings.exclude_keywords)?;
        if !exclude.is_empty() {
            rules.push(Rule::ExcludeKeywords(exclude));
        }
        for (field, allowed) in [
            (WhitelistField::Funder, &settings.funder_whitelist),
            (WhitelistField::FundingType, &settings.funding_type_whitelist),
        ] {
            if !allowed.is_empty() {
                rules.push(Rule::Whitelist {
                    field,
                    allowed: allowed.clone(),
                });
            }
        }
        if let Some(days) = settings.min_days_to_deadline {
            rules.push(Rule::MinDeadlineDays(days));
        }
        Ok(Self::new(rules))
    }

    pub fn evaluate(&self, opportunity: &Opportunity, today: NaiveDate) -> FilterDecision {
        let mut notes = Vec::new();
        for rule in &self.rules {
            match apply_rule(rule, opportunity, today) {
                Outcome::Pass(Some(note)) => notes.push(note),
                Outcome::Pass(None) => {}
                Outcome::Fail(reason) => return FilterDecision::Reject { reason },
            }
        }
        let reason = if notes.is_empty() {
            "matched default pass-through rules".to_string()
        } else {
            notes.join("; ")
        };
        FilterDecision::Accept { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn grant() -> Opportunity {
        let mut opp = Opportunity::new(
            "ukri_rss",
            "AI Research Grant",
            "https://www.ukri.org/opportunity/ai-research-grant",
        );
        opp.summary = "Support for early-career researchers.".into();
        opp
    }

    fn engine(settings: FilterSettings) -> FilterEngine {
        FilterEngine::from_settings(&settings).unwrap()
    }

    #[test]
    fn include_match_is_accepted_with_reason() {
        let filter = engine(FilterSettings {
            include_keywords: vec!["research".into()],
            exclude_keywords: vec!["undergraduate".into()],
            ..Default::default()
        });
        let decision = filter.evaluate(&grant(), today());
        assert!(decision.is_accepted());
        assert!(decision.reason().contains("research"));
        assert_eq!(decision.reason(), "keywords: research");
    }

    #[test]
    fn exclude_keyword_rejects_with_keyword_in_reason() {
        let filter = engine(FilterSettings {
            include_keywords: vec!["research".into()],
            exclude_keywords: vec!["AI".into()],
            ..Default::default()
        });
        assert_eq!(
            filter.evaluate(&grant(), today()),
            FilterDecision::Reject {
                reason: "exclude-match:AI".into()
            }
        );
    }

    #[test]
    fn missing_include_match_rejects() {
        let filter = engine(FilterSettings {
            include_keywords: vec!["quantum".into()],
            ..Default::default()
        });
        assert_eq!(filter.evaluate(&grant(), today()).reason(), NO_INCLUDE_MATCH);
    }

    #[test]
    fn keywords_respect_word_boundaries_and_whitespace() {
        let filter = engine(FilterSettings {
            include_keywords: vec!["AI".into(), "digital  twin".into()],
            ..Default::default()
        });
        let mut opp = grant();
        opp.title = "Maintenance of facilities".into();
        opp.summary.clear();
        assert!(!filter.evaluate(&opp, today()).is_accepted());

        opp.title = "Building a Digital\ntwin for ports".into();
        let decision = filter.evaluate(&opp, today());
        assert_eq!(decision.reason(), "keywords: digital  twin");

        opp.title = "Trustworthy AI, at scale".into();
        assert!(filter.evaluate(&opp, today()).is_accepted());
    }

    #[test]
    fn first_failing_rule_decides_reason() {
        let filter = engine(FilterSettings {
            include_keywords: vec!["nothing-here".into()],
            exclude_keywords: vec!["AI".into()],
            funder_whitelist: vec!["MRC".into()],
            ..Default::default()
        });
        assert_eq!(filter.evaluate(&grant(), today()).reason(), NO_INCLUDE_MATCH);
    }

    #[test]
    fn whitelists_match_case_insensitively() {
        let filter = engine(FilterSettings {
            funder_whitelist: vec!["bbsrc".into()],
            funding_type_whitelist: vec!["Grant".into()],
            ..Default::default()
        });
        let mut opp = grant();
        assert_eq!(
            filter.evaluate(&opp, today()).reason(),
            FUNDER_NOT_WHITELISTED
        );

        opp.funder = Some("EPSRC, BBSRC".into());
        assert_eq!(filter.evaluate(&opp, today()).reason(), TYPE_NOT_WHITELISTED);

        opp.funding_type = Some("grant".into());
        let decision = filter.evaluate(&opp, today());
        assert!(decision.is_accepted());
        assert_eq!(decision.reason(), "funder: EPSRC, BBSRC; funding type: grant");
    }

    #[test]
    fn deadline_window_rejects_close_deadlines_only() {
        let filter = engine(FilterSettings {
            min_days_to_deadline: Some(7),
            ..Default::default()
        });
        let mut opp = grant();
        opp.deadline = Some(today() + Duration::days(2));
        assert_eq!(filter.evaluate(&opp, today()).reason(), DEADLINE_TOO_SOON);

        opp.deadline = None;
        assert!(filter.evaluate(&opp, today()).is_accepted());

        opp.deadline = Some(today() + Duration::days(7));
        assert_eq!(filter.evaluate(&opp, today()).reason(), "deadline in 7 days");
    }

    #[test]
    fn evaluation_is_repeatable() {
        let filter = engine(FilterSettings {
            include_keywords: vec!["grant".into(), "research".into()],
            min_days_to_deadline: Some(1),
            ..Default::default()
        });
        let mut opp = grant();
        opp.deadline = Some(today() + Duration::days(30));
        let first = filter.evaluate(&opp, today());
        let second = filter.evaluate(&opp, today());
        assert_eq!(first, second);
        assert_eq!(
            first.reason(),
            "keywords: grant, research; deadline in 30 days"
        );
    }

    #[test]
    fn empty_engine_passes_everything() {
        let decision = FilterEngine::default().evaluate(&grant(), today());
        assert_eq!(
            decision,
            FilterDecision::Accept {
                reason: "matched default pass-through rules".into()
            }
        );
    }
}
