//! Quiet-model transform
//!
//! Strips the stochastic texture from a description so a run exposes its
//! deterministic skeleton: noise amplitudes drop to zero and each fiber
//! population's firing probability is folded into its outgoing strengths,
//! with the probability itself forced to 1. Presynaptic strengths below 1
//! attenuate multiplicatively, so the fold is a power law there.

use respire_model::{NetworkDescription, SynKind};

/// Apply the quiet transform in place
pub fn quiet_model(desc: &mut NetworkDescription) {
    for cp in &mut desc.cellpops {
        cp.noise_amp = 0.0;
    }
    let presynaptic = desc.global.presynaptic;
    let syntypes = desc.syntypes.clone();
    for fp in &mut desc.fiberpops {
        let probability = fp.probability;
        fp.probability = 1.0;
        for tp in &mut fp.targets {
            let kind = syntypes[tp.syntype - 1].kind;
            if !presynaptic || kind == SynKind::Normal {
                tp.strength *= probability;
            } else if tp.strength < 1.0 {
                tp.strength = tp.strength.powf(probability);
            } else {
                tp.strength = (tp.strength - 1.0) * probability + 1.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(presynaptic: bool, strength: f64, kind: &str) -> NetworkDescription {
        let src = format!(
            r#"
respire description 1
global {{ step = 0.5  step_count = 10  presynaptic = {} }}
syntype 1 {{ name = "n"  kind = "normal"  time_constant = 1 }}
syntype 2 {{ name = "m"  kind = "{}"  parent = 1  time_constant = 1 }}
cellpop 1 {{ name = "c"  count = 1  thresh = 10  noise_amp = 0.5 }}
fiberpop 1 {{
    name = "f"  kind = "stochastic"  count = 1  probability = 0.5
    start = 0  stop = 5  seed = 1
    target 1 {{ mct = 0  nct = 1  nt = 1  syntype = 2  strength = {}  seed = 2 }}
}}
"#,
            i32::from(presynaptic),
            kind,
            strength
        );
        NetworkDescription::parse(&src).unwrap()
    }

    #[test]
    fn test_noise_and_probability_folded() {
        let mut d = desc(false, 0.4, "pre");
        quiet_model(&mut d);
        assert_eq!(d.cellpops[0].noise_amp, 0.0);
        assert_eq!(d.fiberpops[0].probability, 1.0);
        // non-presynaptic run: plain scaling regardless of kind
        assert!((d.fiberpops[0].targets[0].strength - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_presynaptic_power_fold() {
        let mut d = desc(true, 0.25, "pre");
        quiet_model(&mut d);
        let s = d.fiberpops[0].targets[0].strength;
        assert!((s - 0.25f64.powf(0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_presynaptic_facilitation_fold() {
        let mut d = desc(true, 1.5, "pre");
        quiet_model(&mut d);
        let s = d.fiberpops[0].targets[0].strength;
        assert!((s - 1.25).abs() < 1e-12);
    }
}
