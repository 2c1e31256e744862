//! Convergence/divergence diagnostics
//!
//! Before a run starts, `--condi` dumps two CSVs describing the wired
//! network: `condi_<spawn>.csv` tallies the terminals of every
//! (source cell → target cell, synapse type) connection, and
//! `condi_mean_sdev_<spawn>.csv` summarizes per-link divergence (terminals
//! leaving each source cell) and convergence (terminals arriving at each
//! target cell) as means and standard deviations.

use crate::error::Result;
use crate::network::Network;
use respire_model::SynKind;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn syn_label(net: &Network, syntype: usize) -> String {
    match net.syntypes[syntype - 1].kind {
        SynKind::Pre => format!("pre {}", syntype),
        SynKind::Post => format!("post {}", syntype),
        _ => format!("{}", syntype),
    }
}

/// (source pop, target pop, syntype) → per-cell terminal counts
type LinkCounts = HashMap<(usize, usize, usize), Vec<u32>>;

fn mean_sdev(counts: &[u32]) -> (f64, f64) {
    let n = counts.len() as f64;
    if n < 2.0 {
        return (counts.first().copied().unwrap_or(0) as f64, 0.0);
    }
    let sum: u64 = counts.iter().map(|&c| u64::from(c)).sum();
    let sumsq: u64 = counts.iter().map(|&c| u64::from(c) * u64::from(c)).sum();
    let mean = sum as f64 / n;
    let sdev = ((n * sumsq as f64 - (sum as f64).powi(2)) / (n * (n - 1.0))).sqrt();
    (mean, sdev)
}

/// Write both condi CSVs into `out_dir`; returns their paths
pub fn write_condi(net: &Network, out_dir: &Path, spawn: i32) -> Result<Vec<PathBuf>> {
    let conn_path = out_dir.join(format!("condi_{:02}.csv", spawn));
    let stat_path = out_dir.join(format!("condi_mean_sdev_{:02}.csv", spawn));

    let mut divergence: LinkCounts = HashMap::new();
    let mut convergence: LinkCounts = HashMap::new();

    let mut conn = BufWriter::new(File::create(&conn_path)?);
    writeln!(conn, "SP,SC,TP,TC,Terms.,Syntype")?;
    for (pn, pop) in net.cellpops.iter().enumerate() {
        for (cn, cell) in pop.cells.iter().enumerate() {
            // tally this cell's terminals per (target cell, type)
            let mut tally: HashMap<(usize, usize, usize), u32> = HashMap::new();
            for t in &cell.targets {
                let slot = &net.slots[t.slot as usize];
                *tally.entry((slot.pop, slot.cell, slot.syntype)).or_default() += 1;
            }
            let mut rows: Vec<_> = tally.into_iter().collect();
            rows.sort_by_key(|&((tp, tc, st), _)| (tp, tc, st));
            for ((tpop, tcell, syntype), count) in rows {
                divergence
                    .entry((pn, tpop, syntype))
                    .or_insert_with(|| vec![0; pop.cells.len()])[cn] += count;
                convergence
                    .entry((pn, tpop, syntype))
                    .or_insert_with(|| vec![0; net.cellpops[tpop].cells.len()])[tcell] += count;
                writeln!(
                    conn,
                    "{},{},{},{},{},{}",
                    pn + 1,
                    cn + 1,
                    tpop + 1,
                    tcell + 1,
                    count,
                    syn_label(net, syntype)
                )?;
            }
        }
    }
    conn.flush()?;

    let mut stat = BufWriter::new(File::create(&stat_path)?);
    writeln!(
        stat,
        "SP,TP,Syntype,MCT,NCT,NT,STR,SCNT,TCNT,DV_mean,DV_sdev,NT_mean,CV_mean,CV_sdev"
    )?;
    for (pn, pop) in net.cellpops.iter().enumerate() {
        if pop.cells.is_empty() {
            continue;
        }
        for tp in &pop.targets {
            let tpop = tp.pop - 1;
            let tcp = &net.cellpops[tpop];
            if tcp.cells.is_empty() {
                continue;
            }
            let key = (pn, tpop, tp.syntype);
            let Some(dv) = divergence.get(&key) else { continue };
            let (dv_mean, dv_sdev) = mean_sdev(dv);
            if dv_mean == 0.0 {
                continue;
            }
            let (cv_mean, cv_sdev) = convergence
                .get(&key)
                .map(|cv| mean_sdev(cv))
                .unwrap_or((0.0, 0.0));
            writeln!(
                stat,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                pn + 1,
                tpop + 1,
                syn_label(net, tp.syntype),
                tp.mct,
                tp.nct,
                tp.terminals,
                tp.strength,
                pop.cells.len(),
                tcp.cells.len(),
                dv_mean,
                dv_sdev,
                f64::from(tp.terminals) / dv_mean,
                cv_mean,
                cv_sdev
            )?;
        }
    }
    stat.flush()?;

    Ok(vec![conn_path, stat_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::NetworkBuilder;
    use respire_model::NetworkDescription;
    use tempfile::tempdir;

    #[test]
    fn test_condi_files_written() {
        let desc = NetworkDescription::parse(
            r#"
respire description 1
global { step = 0.5  step_count = 10 }
syntype 1 { name = "s"  kind = "normal"  time_constant = 1 }
cellpop 1 {
    name = "src"  count = 3  thresh = 10
    target 2 { mct = 1  nct = 4  nt = 5  syntype = 1  strength = 0.1  seed = 7 }
}
cellpop 2 { name = "dst"  count = 4  thresh = 10 }
"#,
        )
        .unwrap();
        let net = NetworkBuilder::new(&desc).build().unwrap();
        let dir = tempdir().unwrap();
        let paths = write_condi(&net, dir.path(), 3).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].file_name().unwrap().to_str().unwrap() == "condi_03.csv");

        let conn = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(conn.starts_with("SP,SC,TP,TC,Terms.,Syntype"));
        // each of the 3 source cells wired 5 terminals into pop 2
        let total: u32 = conn
            .lines()
            .skip(1)
            .map(|l| l.split(',').nth(4).unwrap().parse::<u32>().unwrap())
            .sum();
        assert_eq!(total, 15);

        let stat = std::fs::read_to_string(&paths[1]).unwrap();
        let row = stat.lines().nth(1).expect("one summary row");
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "2");
        // mean divergence is NT per source cell
        assert_eq!(fields[9], "5");
    }
}
