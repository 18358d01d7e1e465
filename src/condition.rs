//! Condition engine (spec §4.3): a disjunction of term-sets, each a
//! conjunction of per-channel terms, evaluated against the sample stream.

use crate::error::{Error, Result};
use crate::sample_view::channel_bytes_at;
use mlua::Table as LuaTable;
use mlua::Value as LuaValue;

/// One per-channel predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTerm {
    High,
    Low,
    Rising,
    Falling,
    EitherEdge,
    NoEdge,
}

impl ChannelTerm {
    fn matches(&self, prev: u8, cur: u8) -> bool {
        match self {
            ChannelTerm::High => cur == 1,
            ChannelTerm::Low => cur == 0,
            ChannelTerm::Rising => prev == 0 && cur == 1,
            ChannelTerm::Falling => prev == 1 && cur == 0,
            ChannelTerm::EitherEdge => prev != cur,
            ChannelTerm::NoEdge => prev == cur,
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "high" => ChannelTerm::High,
            "low" => ChannelTerm::Low,
            "rising" => ChannelTerm::Rising,
            "falling" => ChannelTerm::Falling,
            "either_edge" => ChannelTerm::EitherEdge,
            "no_edge" => ChannelTerm::NoEdge,
            other => return Err(Error::arg(format!("unknown term type {other:?}"))),
        })
    }
}

/// One conjunction (AND) of per-channel terms plus an optional `skip(n)`.
/// "A term-set that is entirely None is treated as matching" — an empty
/// term-set (no channel terms, no skip) matches on the first sample it is
/// checked against.
#[derive(Debug, Clone, Default)]
pub struct TermSet {
    channel_terms: Vec<(usize, ChannelTerm)>,
    /// `(requested, already_skipped)`. Reset whenever the term-set is
    /// rebuilt (i.e. on every fresh `wait()` call).
    skip: Option<(u64, u64)>,
}

impl TermSet {
    pub fn empty() -> Self {
        TermSet::default()
    }

    pub fn with_term(mut self, channel: usize, term: ChannelTerm) -> Self {
        self.channel_terms.push((channel, term));
        self
    }

    pub fn with_skip(mut self, n: u64) -> Self {
        self.skip = Some((n, 0));
        self
    }

    /// Evaluate this term-set against one sample, given the previous
    /// sample's pin values (`pin_history`) and the current sample's
    /// `channel_bytes`. Mutates the skip counter in place.
    fn step(&mut self, pin_history: &[u8], channel_bytes: &[u8]) -> bool {
        let skip_done = match &mut self.skip {
            None => true,
            Some((requested, already)) => {
                if *already >= *requested {
                    true
                } else {
                    *already += 1;
                    false
                }
            }
        };
        if !skip_done {
            return false;
        }
        self.channel_terms.iter().all(|&(ch, term)| {
            let prev = pin_history.get(ch).copied().unwrap_or(0);
            let cur = channel_bytes.get(ch).copied().unwrap_or(0);
            term.matches(prev, cur)
        })
    }

    fn is_vacuous(&self) -> bool {
        self.channel_terms.is_empty() && self.skip.is_none()
    }
}

/// A disjunction (OR) of term-sets. `None`/empty matches immediately
/// without consuming a sample.
#[derive(Debug, Clone, Default)]
pub struct ConditionList {
    term_sets: Vec<TermSet>,
}

impl ConditionList {
    pub fn none() -> Self {
        ConditionList::default()
    }

    pub fn from_term_sets(term_sets: Vec<TermSet>) -> Self {
        ConditionList { term_sets }
    }

    pub fn is_immediate(&self) -> bool {
        self.term_sets.is_empty()
    }

    /// Parse the Lua `conds` argument to `wait(conds)`: `nil`, a single
    /// term-map table, or a list of term-map tables.
    pub fn from_lua(value: &LuaValue) -> Result<ConditionList> {
        match value {
            LuaValue::Nil => Ok(ConditionList::none()),
            LuaValue::Table(t) => {
                if table_is_termset_list(t)? {
                    let mut sets = Vec::new();
                    for pair in t.clone().sequence_values::<LuaTable>() {
                        sets.push(parse_termset(&pair?)?);
                    }
                    Ok(ConditionList::from_term_sets(sets))
                } else {
                    Ok(ConditionList::from_term_sets(vec![parse_termset(t)?]))
                }
            }
            other => Err(Error::arg(format!(
                "wait() conditions must be nil or a table, got {}",
                other.type_name()
            ))),
        }
    }
}

fn table_is_termset_list(t: &LuaTable) -> Result<bool> {
    // A list-of-term-sets has its first array element be itself a table.
    let first: LuaValue = t.get(1)?;
    Ok(matches!(first, LuaValue::Table(_)))
}

fn parse_termset(t: &LuaTable) -> Result<TermSet> {
    let mut ts = TermSet::empty();
    for pair in t.clone().pairs::<LuaValue, LuaValue>() {
        let (key, val) = pair?;
        match key {
            LuaValue::String(s) if s.to_str().ok() == Some("skip") => {
                let n = match val {
                    LuaValue::Integer(i) => i.max(0) as u64,
                    LuaValue::Number(f) => f.max(0.0) as u64,
                    other => {
                        return Err(Error::arg(format!(
                            "skip count must be a number, got {}",
                            other.type_name()
                        )))
                    }
                };
                ts = ts.with_skip(n);
            }
            LuaValue::Integer(ch) => {
                let term_name = match val {
                    LuaValue::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
                    other => {
                        return Err(Error::arg(format!(
                            "term value must be a string, got {}",
                            other.type_name()
                        )))
                    }
                };
                let term = ChannelTerm::from_str(&term_name)?;
                ts = ts.with_term(ch as usize, term);
            }
            other => {
                return Err(Error::arg(format!(
                    "unexpected key in term-set: {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(ts)
}

/// Result of one `run` over a buffer window.
pub struct MatchOutcome {
    pub matched: bool,
    /// One flag per term-set, true for every term-set that matched on the
    /// sample that produced a match (§4.3: "multiple term-sets may match on
    /// the same sample; match_array reports all of them").
    pub match_array: Vec<bool>,
    pub matched_samplenum: u64,
}

/// Run the condition engine from `cur_samplenum` (inclusive) up to
/// `end_samplenum` (exclusive) against `buf`, updating `pin_history` and
/// `cur_samplenum` in place. `buf` holds the whole chunk; `buf_start` is the
/// `absolute_samplenum` of `buf`'s first sample.
pub fn run(
    conditions: &mut ConditionList,
    buf: &[u8],
    buf_start: u64,
    unitsize: usize,
    channel_map: &[i32],
    pin_history: &mut Vec<u8>,
    cur_samplenum: &mut u64,
    end_samplenum: u64,
) -> Option<MatchOutcome> {
    if conditions.is_immediate() {
        return Some(MatchOutcome {
            matched: true,
            match_array: Vec::new(),
            matched_samplenum: *cur_samplenum,
        });
    }

    while *cur_samplenum < end_samplenum {
        let local_index = (*cur_samplenum - buf_start) as usize;
        let channel_bytes = channel_bytes_at(buf, local_index, unitsize, channel_map);

        let mut match_array = Vec::with_capacity(conditions.term_sets.len());
        let mut any = false;
        for ts in conditions.term_sets.iter_mut() {
            let m = if ts.is_vacuous() {
                true
            } else {
                ts.step(pin_history, &channel_bytes)
            };
            match_array.push(m);
            any |= m;
        }

        *pin_history = channel_bytes;
        let matched_at = *cur_samplenum;
        *cur_samplenum += 1;

        if any {
            return Some(MatchOutcome {
                matched: true,
                match_array,
                matched_samplenum: matched_at,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_over(
        conds: &mut ConditionList,
        buf: &[u8],
        pin_history: &mut Vec<u8>,
        cur: &mut u64,
    ) -> Option<MatchOutcome> {
        let end = *cur + buf.len() as u64;
        run(conds, buf, *cur, 1, &[0], pin_history, cur, end)
    }

    #[test]
    fn s1_edge_detection_across_two_chunks() {
        let mut conds = ConditionList::from_term_sets(vec![TermSet::empty().with_term(0, ChannelTerm::Rising)]);
        let mut pin_history = vec![0u8];
        let mut cur = 0u64;

        let chunk1 = [0u8, 0u8, 1u8];
        let outcome = run_over(&mut conds, &chunk1, &mut pin_history, &mut cur).unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.matched_samplenum, 2);

        let mut conds2 = ConditionList::from_term_sets(vec![TermSet::empty().with_term(0, ChannelTerm::Rising)]);
        let chunk2 = [1u8, 0u8, 1u8];
        let mut cur2 = 3u64;
        let outcome2 = run_over(&mut conds2, &chunk2, &mut pin_history, &mut cur2).unwrap();
        assert!(outcome2.matched);
        assert_eq!(outcome2.matched_samplenum, 5);
    }

    #[test]
    fn s4_skip_matches_after_exact_count() {
        let mut conds = ConditionList::from_term_sets(vec![TermSet::empty().with_skip(10)]);
        let mut pin_history = vec![0u8];
        let mut cur = 100u64;
        let buf = vec![0u8; 20];
        let outcome = run(&mut conds, &buf, 100, 1, &[0], &mut pin_history, &mut cur, 120).unwrap();
        assert_eq!(outcome.matched_samplenum, 110);
    }

    #[test]
    fn skip_zero_matches_current_sample() {
        let mut conds = ConditionList::from_term_sets(vec![TermSet::empty().with_skip(0)]);
        let mut pin_history = vec![0u8];
        let mut cur = 50u64;
        let buf = vec![0u8; 5];
        let outcome = run(&mut conds, &buf, 50, 1, &[0], &mut pin_history, &mut cur, 55).unwrap();
        assert_eq!(outcome.matched_samplenum, 50);
    }

    #[test]
    fn s5_or_of_and_reports_per_termset_match_array() {
        // term-set 0: high(0) & low(1); term-set 1: falling(0).
        let mut conds = ConditionList::from_term_sets(vec![
            TermSet::empty().with_term(0, ChannelTerm::High).with_term(1, ChannelTerm::Low),
            TermSet::empty().with_term(0, ChannelTerm::Falling),
        ]);
        let mut pin_history = vec![1u8, 0u8];
        let mut cur = 0u64;
        // Packed sample byte with ch0=0,ch1=0: 0b00000000
        let buf = [0b0000_0000u8];
        let outcome = run(&mut conds, &buf, 0, 1, &[0, 1], &mut pin_history, &mut cur, 1).unwrap();
        assert_eq!(outcome.match_array, vec![false, true]);
    }

    #[test]
    fn no_match_returns_none_at_chunk_end() {
        let mut conds = ConditionList::from_term_sets(vec![TermSet::empty().with_term(0, ChannelTerm::Rising)]);
        let mut pin_history = vec![1u8];
        let mut cur = 0u64;
        let buf = [1u8, 1u8, 1u8];
        let outcome = run(&mut conds, &buf, 0, 1, &[0], &mut pin_history, &mut cur, 3);
        assert!(outcome.is_none());
        assert_eq!(cur, 3);
    }

    #[test]
    fn immediate_match_on_nil_conditions_consumes_nothing() {
        let mut conds = ConditionList::none();
        let mut pin_history = vec![0u8];
        let mut cur = 42u64;
        let buf = [0u8];
        let outcome = run(&mut conds, &buf, 42, 1, &[0], &mut pin_history, &mut cur, 43).unwrap();
        assert_eq!(outcome.matched_samplenum, 42);
        assert_eq!(cur, 42);
    }
}
