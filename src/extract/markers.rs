//! Text reward markers used by the bots over time

use regex::Regex;

use crate::model::Currency;

/// One `amount CURRENCY` occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub amount: String,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// `**CLAIM 17.5 WXDAI**`
    Bold(Payout),
    /// `[[ 17.5 WXDAI ]]` blocks paired with the `###### @user` lines after them
    Alt(Vec<(Option<String>, Payout)>),
    /// `CLAIM 17.5 WXDAI`
    Bare(Payout),
}

/// Compiled marker patterns
#[derive(Debug, Clone)]
pub struct MarkerPatterns {
    bold: Regex,
    alt: Regex,
    alt_user: Regex,
    bare: Regex,
    payout: Regex,
    mention: Regex,
    multi_user: Regex,
}

impl MarkerPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bold: Regex::new(r"\*\*CLAIM (\d+(?:\.\d+)?) (XDAI|DAI|WXDAI)\*\*")?,
            alt: Regex::new(r"\[\s*\[\s*(\d+(?:\.\d+)?)\s*(XDAI|DAI|WXDAI)\s*\]\s*\]")?,
            alt_user: Regex::new(r"###### @([\w-]+)")?,
            bare: Regex::new(r"CLAIM (\d+(?:\.\d+)?) (XDAI|DAI|WXDAI)")?,
            payout: Regex::new(r"\*?(\d+(?:\.\d+)?) \*?(XDAI|DAI|WXDAI)\*?")?,
            mention: Regex::new(r"@([A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)")?,
            multi_user: Regex::new(r"\[ \*\*([^:\]]+):")?,
        })
    }

    /// First marker found, in bold → alt → bare order
    pub fn find_marker(&self, body: &str) -> Option<Marker> {
        if let Some(payout) = first_payout(&self.bold, body) {
            return Some(Marker::Bold(payout));
        }

        let alt: Vec<Payout> = all_payouts(&self.alt, body);
        if !alt.is_empty() {
            let users = self.alt_users(body);
            let pairs = alt
                .into_iter()
                .enumerate()
                .map(|(i, payout)| (users.get(i).cloned(), payout))
                .collect();
            return Some(Marker::Alt(pairs));
        }

        first_payout(&self.bare, body).map(Marker::Bare)
    }

    /// Every `amount CURRENCY` occurrence, in order
    pub fn payouts(&self, body: &str) -> Vec<Payout> {
        all_payouts(&self.payout, body)
    }

    /// Distinct `@username` mentions, in order of first appearance
    pub fn mentions(&self, body: &str) -> Vec<String> {
        distinct_captures(&self.mention, body)
    }

    /// Distinct `[ **username:` markers, in order of first appearance
    pub fn multi_permit_users(&self, body: &str) -> Vec<String> {
        distinct_captures(&self.multi_user, body)
            .into_iter()
            .map(|u| u.trim().trim_start_matches('@').to_string())
            .collect()
    }

    fn alt_users(&self, body: &str) -> Vec<String> {
        self.alt_user
            .captures_iter(body)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }
}

fn to_payout(caps: &regex::Captures<'_>) -> Option<Payout> {
    let amount = caps.get(1)?.as_str().to_string();
    let currency = caps.get(2)?.as_str().parse().ok()?;
    Some(Payout { amount, currency })
}

fn first_payout(re: &Regex, body: &str) -> Option<Payout> {
    re.captures(body).as_ref().and_then(to_payout)
}

fn all_payouts(re: &Regex, body: &str) -> Vec<Payout> {
    re.captures_iter(body).filter_map(|c| to_payout(&c)).collect()
}

fn distinct_captures(re: &Regex, body: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in re.captures_iter(body) {
        if let Some(m) = caps.get(1) {
            let value = m.as_str().to_string();
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payout(amount: &str, currency: Currency) -> Payout {
        Payout {
            amount: amount.to_string(),
            currency,
        }
    }

    #[test]
    fn test_bold_wins_over_bare() {
        let patterns = MarkerPatterns::new().unwrap();
        let marker = patterns.find_marker("**CLAIM 17.5 WXDAI**");
        assert_eq!(marker, Some(Marker::Bold(payout("17.5", Currency::Wxdai))));
    }

    #[test]
    fn test_bare_fallback() {
        let patterns = MarkerPatterns::new().unwrap();
        let marker = patterns.find_marker("[CLAIM 25 DAI](https://pay.ubq.fi?claim=abc)");
        assert_eq!(marker, Some(Marker::Bare(payout("25", Currency::Dai))));
    }

    #[test]
    fn test_alt_pairs_users_positionally() {
        let patterns = MarkerPatterns::new().unwrap();
        let body = "[ [ 10 WXDAI ] ](https://pay.ubq.fi?claim=a)\n###### @alice\n\
                    [ [ 2.5 WXDAI ] ](https://pay.ubq.fi?claim=b)\n###### @bob\n\
                    [ [ 1 WXDAI ] ](https://pay.ubq.fi?claim=c)\n";
        let Some(Marker::Alt(pairs)) = patterns.find_marker(body) else {
            panic!("expected alt marker");
        };
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], (Some("alice".to_string()), payout("10", Currency::Wxdai)));
        assert_eq!(pairs[1].0.as_deref(), Some("bob"));
        assert_eq!(pairs[2].0, None);
    }

    #[test]
    fn test_no_marker() {
        let patterns = MarkerPatterns::new().unwrap();
        assert_eq!(patterns.find_marker("LGTM, merging"), None);
        assert_eq!(patterns.find_marker("CLAIM 5 USDC"), None);
    }

    #[test]
    fn test_mentions_and_multi_permit_users() {
        let patterns = MarkerPatterns::new().unwrap();
        let body = "[ **alice: 5 WXDAI** ] [ **bob: 3 WXDAI** ] thanks @alice @carol @alice";
        assert_eq!(patterns.mentions(body), vec!["alice", "carol"]);
        assert_eq!(patterns.multi_permit_users(body), vec!["alice", "bob"]);
        assert_eq!(patterns.payouts(body).len(), 2);
    }
}
