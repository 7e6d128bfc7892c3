//! Demand extraction: find the monetary demand on the early pages of a
//! complaint.
//!
//! The same logical value appears under several incompatible form layouts,
//! so we keep a prioritized list of template matchers and stop at the
//! first one that hits anywhere. The regexes are deliberately loose about
//! punctuation: scanned-text OCR routinely misreads `$` as `S`, drops
//! decimal points, and turns colons into semicolons or commas.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    config::{DemandConfig, TemplateKind},
    prelude::*,
};

/// The amount tail shared by every template: an optional separator, a
/// dollar sign (or OCR's `S` for it), and 3-7 digits with optional
/// thousands/decimal punctuation. Demands in limited-jurisdiction cases
/// run from hundreds to $25,000, always written with cents.
const AMOUNT_TAIL: &str = r"\s*[:;,.\-]?\s*[$Ss]\s*(\d{0,2}[,.]?\d{0,3}[.,]?\d{2})";

macro_rules! template_regex {
    ($name:ident, $prefix:literal) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(&format!("(?i){}{}", $prefix, AMOUNT_TAIL))
                .expect("failed to compile template regex")
        });
    };
}

template_regex!(DEMAND, r"\bdemand");
template_regex!(DEMAND_AMOUNT, r"\bdemand\s+amount");
template_regex!(AMOUNT_OF_DEMAND, r"\bamount\s+of\s+demand");
template_regex!(PRAYER_AMOUNT, r"\bprayer\s+amount");
template_regex!(DAMAGES_OF, r"\bdamages\s+of");
template_regex!(FOR_DAMAGES_OF, r"\bfor\s+damages\s+of");

impl TemplateKind {
    /// The regex this matcher kind applies.
    fn regex(self) -> &'static Regex {
        match self {
            TemplateKind::DemandLabel => &DEMAND,
            TemplateKind::DemandAmountLabel => &DEMAND_AMOUNT,
            TemplateKind::AmountOfDemandLabel => &AMOUNT_OF_DEMAND,
            TemplateKind::PrayerAmountLabel => &PRAYER_AMOUNT,
            TemplateKind::DamagesOf => &DAMAGES_OF,
            TemplateKind::ForDamagesOf => &FOR_DAMAGES_OF,
        }
    }

    /// The 1-based page this matcher is restricted to, if any. The
    /// "damages of" clauses only ever appear in the prayer section.
    fn page_scope(self) -> Option<usize> {
        match self {
            TemplateKind::DamagesOf => Some(2),
            TemplateKind::ForDamagesOf => Some(3),
            _ => None,
        }
    }
}

/// A matched demand, with where it was found for diagnostics.
#[derive(Debug, PartialEq)]
pub struct DemandMatch {
    /// The parsed demand amount, in dollars.
    pub amount: f64,

    /// Which template matched.
    pub template: TemplateKind,

    /// The 1-based page the match was found on.
    pub page_number: usize,
}

/// Search OCR page texts for a demand amount.
///
/// Pages are scanned in order; on each page the templates are tried in
/// their configured priority order, and the first successful match
/// short-circuits the rest of the search. Running this twice on the same
/// input always produces the same output.
pub fn extract_demand(
    page_texts: &[(usize, String)],
    config: &DemandConfig,
) -> Result<DemandMatch, ExtractError> {
    for (page_number, text) in page_texts {
        for &template in &config.templates {
            if let Some(scope) = template.page_scope()
                && scope != *page_number
            {
                continue;
            }
            if let Some(captures) = template.regex().captures(text) {
                let raw = captures
                    .get(1)
                    .expect("template regex has one capture group")
                    .as_str();
                let amount = normalize_amount(raw)?;
                if amount > config.warn_above {
                    warn!(
                        amount = amount,
                        page = page_number,
                        "detected demand is above the expected maximum"
                    );
                }
                debug!(
                    amount = amount,
                    page = page_number,
                    template = ?template,
                    "found demand"
                );
                return Ok(DemandMatch {
                    amount,
                    template,
                    page_number: *page_number,
                });
            }
        }
    }
    Err(ExtractError::no_pattern())
}

/// Normalize a matched amount string and parse it as dollars.
///
/// Strips the currency symbol, commas, and whitespace. When the remainder
/// is a well-formed decimal it is used as-is; when OCR garbled the
/// punctuation (digits only, or a comma where the decimal point belongs),
/// the trailing two digits are treated as cents, since these forms always
/// carry cents.
pub fn normalize_amount(raw: &str) -> Result<f64, ExtractError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != ',')
        .collect();

    if let Some((_, cents)) = cleaned.rsplit_once('.')
        && cents.len() == 2
        && cleaned.matches('.').count() == 1
        && cleaned.chars().all(|c| c.is_ascii_digit() || c == '.')
    {
        return cleaned
            .parse::<f64>()
            .map_err(|_| ExtractError::Parse(raw.to_owned()));
    }

    let digits: String = cleaned.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() || digits.len() != cleaned.chars().filter(|c| *c != '.').count() {
        return Err(ExtractError::Parse(raw.to_owned()));
    }
    digits
        .parse::<f64>()
        .map(|v| v / 100.0)
        .map_err(|_| ExtractError::Parse(raw.to_owned()))
}
