//! Mid-run parameter reload
//!
//! An update command swaps in a freshly built network while the run is
//! paused between ticks. Runtime state is copied element-wise at matching
//! (population, cell, synapse-type) coordinates — membrane state, spike
//! flags, noise state, conductances — and each delay queue is carried
//! across by aligning entries on (step + offset) mod length, so in-flight
//! contributions keep their arrival ticks. Populations, cells, or types
//! the new description no longer has are simply dropped; new ones start
//! from build-time state.

use crate::network::Network;

/// Copy runtime state from the old network into the new one at matching
/// coordinates. `stepnum` anchors the queue alignment.
pub fn copy_state(old: &Network, new: &mut Network, stepnum: i64) {
    let cellpop_count = old.cellpops.len().min(new.cellpops.len());
    for pn in 0..cellpop_count {
        let pold = &old.cellpops[pn];
        let pnew = &mut new.cellpops[pn];
        pnew.noise_seed = pold.noise_seed;

        let cell_count = pold.cells.len().min(pnew.cells.len());
        for cn in 0..cell_count {
            let cold = &pold.cells[cn];
            {
                let cnew = &mut pnew.cells[cn];
                cnew.vm_prev = cold.vm_prev;
                cnew.vm = cold.vm;
                cnew.gk = cold.gk;
                cnew.thr = cold.thr;
                cnew.spike = cold.spike;
                cnew.gnoise_e = cold.gnoise_e;
                cnew.gnoise_i = cold.gnoise_i;
            }

            // synapse slots match on type, not position
            let new_range = pnew.cells[cn].slot_range();
            for old_slot in &old.slots[cold.slot_range()] {
                for new_idx in new_range.clone() {
                    if new.slots[new_idx].syntype != old_slot.syntype {
                        continue;
                    }
                    let snew = &mut new.slots[new_idx];
                    snew.g = old_slot.g;
                    let q_count = old_slot.q.len().min(snew.q.len());
                    for qidx in 0..q_count {
                        let from = (stepnum as usize + qidx) % old_slot.q.len();
                        let to = (stepnum as usize + qidx) % snew.q.len();
                        snew.q[to] = old_slot.q[from];
                    }
                    break;
                }
            }
        }
    }

    let fiberpop_count = old.fiberpops.len().min(new.fiberpops.len());
    for pn in 0..fiberpop_count {
        new.fiberpops[pn].seed = old.fiberpops[pn].seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::NetworkBuilder;
    use respire_model::NetworkDescription;

    fn build(count: usize) -> Network {
        let src = format!(
            r#"
respire description 1
global {{ step = 0.5  step_count = 100 }}
syntype 1 {{ name = "s"  kind = "normal"  time_constant = 1.5 }}
cellpop 1 {{ name = "c"  count = {} thresh = 10 }}
fiberpop 1 {{
    name = "f"  kind = "stochastic"  count = 1  probability = 1
    start = 0  stop = 50  seed = 11
    target 1 {{ mct = 3  nct = 7  nt = 4  syntype = 1  strength = 0.1  seed = 55 }}
}}
"#,
            count
        );
        let desc = NetworkDescription::parse(&src).unwrap();
        NetworkBuilder::new(&desc).build().unwrap()
    }

    #[test]
    fn test_state_carries_across() {
        let mut old = build(2);
        old.cellpops[0].cells[0].vm = -12.5;
        old.cellpops[0].cells[0].spike = true;
        old.cellpops[0].cells[1].gk = 0.7;
        // schedule a contribution 3 ticks ahead of step 10
        let slot0 = old.cellpops[0].cells[0].slot_start as usize;
        let qlen = old.slots[slot0].q.len();
        old.slots[slot0].g = 0.25;
        old.slots[slot0].q[(10 + 3) % qlen] = 0.1;

        let mut new = build(2);
        copy_state(&old, &mut new, 10);

        assert_eq!(new.cellpops[0].cells[0].vm, -12.5);
        assert!(new.cellpops[0].cells[0].spike);
        assert_eq!(new.cellpops[0].cells[1].gk, 0.7);
        let nslot0 = new.cellpops[0].cells[0].slot_start as usize;
        assert_eq!(new.slots[nslot0].g, 0.25);
        let nqlen = new.slots[nslot0].q.len();
        assert_eq!(new.slots[nslot0].q[(10 + 3) % nqlen], 0.1);
    }

    #[test]
    fn test_shrunken_population_drops_extras() {
        let mut old = build(3);
        for cell in &mut old.cellpops[0].cells {
            cell.vm = 5.0;
        }
        let mut new = build(2);
        copy_state(&old, &mut new, 0);
        assert!(new.cellpops[0].cells.iter().all(|c| c.vm == 5.0));
        assert_eq!(new.cellpops[0].cells.len(), 2);
    }

    #[test]
    fn test_fiber_seed_carries() {
        let mut old = build(1);
        // advance the stream so the state differs from a fresh build
        old.fiberpops[0].seed.uniform();
        let expected = old.fiberpops[0].seed.state();
        let mut new = build(1);
        copy_state(&old, &mut new, 0);
        assert_eq!(new.fiberpops[0].seed.state(), expected);
    }
}
