//! Motor pool discovery and drive evaluation
//!
//! The lung's motor inputs come from cell populations found by name:
//! "phrenic", "lumbar", "PCA"/"ILM", "TA"/"ELM", each optionally carrying a
//! numeric suffix that selects its formula variable (P0, P1, …, L0, …).
//! Names containing the word "pre" are excluded so premotor relays don't
//! shadow the pools. Exactly one population per suffix must match; zero or
//! two of the same suffix is a configuration error. The phrenic and lumbar
//! drives are text formulas over per-population firing rates; the laryngeal
//! pools feed their rates through directly.

use crate::error::{EngineError, Result};
use crate::expr::Expr;
use crate::network::Network;

/// Default phrenic drive when the description gives no formula
pub const DEFAULT_PHRENIC_EQUATION: &str = "P0/100";
/// Default lumbar drive when the description gives no formula
pub const DEFAULT_LUMBAR_EQUATION: &str = "L0/20";

/// Word-boundary match of `word` (case-insensitive) with an optional decimal
/// suffix. Returns the suffix value (0 when absent) on a match.
fn match_keyword(name: &str, word: &str) -> Option<usize> {
    let lower: Vec<char> = name.to_ascii_lowercase().chars().collect();
    let needle: Vec<char> = word.to_ascii_lowercase().chars().collect();
    let n = lower.len();
    let m = needle.len();
    if m == 0 || n < m {
        return None;
    }
    for start in 0..=n - m {
        if lower[start..start + m] != needle[..] {
            continue;
        }
        if start > 0 && lower[start - 1].is_ascii_alphanumeric() {
            continue;
        }
        let mut end = start + m;
        let mut suffix = 0usize;
        let mut have_digits = false;
        while end < n && lower[end].is_ascii_digit() {
            suffix = suffix * 10 + lower[end].to_digit(10).unwrap() as usize;
            have_digits = true;
            end += 1;
        }
        if end < n && lower[end].is_ascii_alphanumeric() {
            continue;
        }
        return Some(if have_digits { suffix } else { 0 });
    }
    None
}

/// True when the name contains the word "pre" on its own boundaries
fn has_pre(name: &str) -> bool {
    match_keyword(name, "pre").is_some()
}

/// One discovered family of motor populations
#[derive(Debug)]
pub struct PopList {
    /// Keywords the family matches on
    keywords: Vec<&'static str>,
    /// Formula variable prefix ("P", "L", or empty for pass-through pools)
    var_prefix: &'static str,
    /// Population index per suffix; None where no population carries it
    pub nums: Vec<Option<usize>>,
    /// Latest firing rates, parallel to `nums`
    pub rates: Vec<f64>,
}

impl PopList {
    fn discover(
        net: &Network,
        keywords: Vec<&'static str>,
        display: &str,
        var_prefix: &'static str,
    ) -> Result<Self> {
        let mut nums: Vec<Option<usize>> = Vec::new();
        let mut found = 0usize;
        for (pn, pop) in net.cellpops.iter().enumerate() {
            if has_pre(&pop.name) {
                continue;
            }
            let suffix = keywords
                .iter()
                .find_map(|word| match_keyword(&pop.name, word));
            let Some(suffix) = suffix else { continue };
            if suffix >= nums.len() {
                nums.resize(suffix + 1, None);
            }
            if nums[suffix].is_some() {
                return Err(EngineError::config(format!(
                    "more than one population named for {} with suffix {} (and without \
                     the word \"pre\"); there must be exactly one",
                    display, suffix
                )));
            }
            nums[suffix] = Some(pn);
            found += 1;
        }
        if found == 0 {
            return Err(EngineError::config(format!(
                "no population named for {} (and without the word \"pre\"); \
                 there must be exactly one",
                display
            )));
        }
        let rates = vec![0.0; nums.len()];
        Ok(Self {
            keywords,
            var_prefix,
            nums,
            rates,
        })
    }

    /// Refresh the rates from the current spike flags
    fn update_rates(&mut self, net: &Network, step_ms: f64) {
        for (slot, num) in self.nums.iter().enumerate() {
            if let Some(pn) = num {
                self.rates[slot] = spikes_per_s_per_cell(net, *pn, step_ms);
            }
        }
    }

    /// Variable name for a suffix slot
    fn var_name(&self, slot: usize) -> String {
        format!("{}{}", self.var_prefix, slot)
    }
}

/// Mean firing rate of a population this tick, in spikes/s/cell
pub fn spikes_per_s_per_cell(net: &Network, pop: usize, step_ms: f64) -> f64 {
    let p = &net.cellpops[pop];
    if p.cells.is_empty() {
        return 0.0;
    }
    let spikes = p.cells.iter().filter(|c| c.spike).count();
    spikes as f64 / p.cells.len() as f64 / (step_ms / 1000.0)
}

/// The discovered motor pools with their compiled drive formulas
#[derive(Debug)]
pub struct MotorPops {
    phrenic: PopList,
    abdominal: PopList,
    pca: PopList,
    ta: PopList,
    phrenic_eq: Expr,
    lumbar_eq: Expr,
}

impl MotorPops {
    /// Discover the pools and compile the drive formulas.
    ///
    /// Empty formulas take the defaults. Formula identifiers are validated
    /// against the discovered pools up front.
    pub fn discover(net: &Network) -> Result<Self> {
        let phrenic = PopList::discover(net, vec!["phrenic"], "\"phrenic\"", "P")?;
        let abdominal = PopList::discover(net, vec!["lumbar"], "\"lumbar\"", "L")?;
        let pca = PopList::discover(net, vec!["pca", "ilm"], "\"PCA\" or \"ILM\"", "")?;
        let ta = PopList::discover(net, vec!["ta", "elm"], "\"TA\" or \"ELM\"", "")?;

        let phrenic_text = if net.global.phrenic_equation.is_empty() {
            DEFAULT_PHRENIC_EQUATION
        } else {
            &net.global.phrenic_equation
        };
        let lumbar_text = if net.global.lumbar_equation.is_empty() {
            DEFAULT_LUMBAR_EQUATION
        } else {
            &net.global.lumbar_equation
        };
        let phrenic_eq = Expr::parse(phrenic_text)?;
        let lumbar_eq = Expr::parse(lumbar_text)?;

        let pools = Self {
            phrenic,
            abdominal,
            pca,
            ta,
            phrenic_eq,
            lumbar_eq,
        };
        pools.validate_formula(&pools.phrenic_eq, &pools.phrenic)?;
        pools.validate_formula(&pools.lumbar_eq, &pools.abdominal)?;

        log::info!(
            "motor pools: phrenic {:?}, abdominal {:?}, ilm/pca {:?}, elm/ta {:?}",
            pools.named(&pools.phrenic),
            pools.named(&pools.abdominal),
            pools.named(&pools.pca),
            pools.named(&pools.ta),
        );
        Ok(pools)
    }

    fn named(&self, list: &PopList) -> Vec<usize> {
        list.nums.iter().flatten().map(|pn| pn + 1).collect()
    }

    fn validate_formula(&self, expr: &Expr, list: &PopList) -> Result<()> {
        for var in expr.variables() {
            let known = (0..list.nums.len())
                .any(|slot| list.nums[slot].is_some() && list.var_name(slot) == *var);
            if !known {
                return Err(EngineError::expression(
                    expr.text(),
                    format!(
                        "unknown identifier {:?} (no {} population carries that suffix)",
                        var,
                        list.keywords.join("/")
                    ),
                ));
            }
        }
        Ok(())
    }

    fn eval_drive(list: &mut PopList, expr: &Expr, net: &Network, step_ms: f64) -> Result<f64> {
        list.update_rates(net, step_ms);
        let rates = &list.rates;
        let prefix = list.var_prefix;
        let nums = &list.nums;
        expr.eval_with(|name| {
            let suffix: usize = name.strip_prefix(prefix)?.parse().ok()?;
            nums.get(suffix)?.as_ref()?;
            rates.get(suffix).copied()
        })
    }

    fn eval_rate(list: &mut PopList, net: &Network, step_ms: f64) -> Result<f64> {
        let pn = list.nums.first().copied().flatten().ok_or_else(|| {
            EngineError::config("motor pool list lost its population")
        })?;
        list.rates[0] = spikes_per_s_per_cell(net, pn, step_ms);
        Ok(list.rates[0])
    }

    /// Evaluate all motor drives against the current spike flags
    pub fn motor_inputs(&mut self, net: &Network, step_ms: f64) -> Result<crate::MotorInputs> {
        Ok(crate::MotorInputs {
            phrenic: Self::eval_drive(&mut self.phrenic, &self.phrenic_eq, net, step_ms)?,
            abdominal: Self::eval_drive(&mut self.abdominal, &self.lumbar_eq, net, step_ms)?,
            pca: Self::eval_rate(&mut self.pca, net, step_ms)?,
            ta: Self::eval_rate(&mut self.ta, net, step_ms)?,
            expic: 0.0,
            inspic: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_boundaries() {
        assert_eq!(match_keyword("phrenic", "phrenic"), Some(0));
        assert_eq!(match_keyword("Phrenic MN", "phrenic"), Some(0));
        assert_eq!(match_keyword("phrenic2", "phrenic"), Some(2));
        assert_eq!(match_keyword("my phrenic12 pool", "phrenic"), Some(12));
        assert_eq!(match_keyword("phrenics", "phrenic"), None);
        assert_eq!(match_keyword("prephrenic", "phrenic"), None);
        assert_eq!(match_keyword("pre-phrenic", "phrenic"), Some(0));
        assert_eq!(match_keyword("lumbar", "phrenic"), None);
    }

    #[test]
    fn test_pre_exclusion() {
        assert!(has_pre("pre-phrenic"));
        assert!(has_pre("phrenic pre"));
        assert!(!has_pre("premotor"));
        assert!(!has_pre("phrenic"));
    }
}
