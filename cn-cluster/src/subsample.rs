//! Cell subsampling: uniform without replacement, or a spike-in mixture
//! drawing fixed shares of cells from each sample of origin.

use crate::cn_table::CnTable;
use crate::common::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;

const PROPORTION_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize)]
pub struct SpikeIn {
    pub sample_ids: Vec<Box<str>>,
    /// one share per sample; equal shares if `None`
    pub proportions: Option<Vec<f64>>,
}

impl SpikeIn {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.sample_ids.is_empty(), "spike-in needs sample ids");

        let distinct: HashSet<&str> = self.sample_ids.iter().map(|x| &**x).collect();
        anyhow::ensure!(
            distinct.len() == self.sample_ids.len(),
            "duplicate spike-in sample ids: {:?}",
            self.sample_ids
        );

        if let Some(props) = &self.proportions {
            anyhow::ensure!(
                props.len() == self.sample_ids.len(),
                "{} proportions for {} sample ids",
                props.len(),
                self.sample_ids.len()
            );
            anyhow::ensure!(
                props.iter().all(|&p| p.is_finite() && p >= 0.0),
                "proportions must be non-negative: {:?}",
                props
            );
            let total: f64 = props.iter().sum();
            anyhow::ensure!(
                (total - 1.0).abs() <= PROPORTION_TOLERANCE,
                "proportions must sum to 1, got {}",
                total
            );
        }
        Ok(())
    }

    /// Number of cells drawn from each sample; sums to `n_cells`
    pub fn counts(&self, n_cells: usize) -> anyhow::Result<Vec<usize>> {
        self.validate()?;
        let ns = self.sample_ids.len();
        let props = match &self.proportions {
            Some(p) => p.clone(),
            None => vec![1.0 / ns as f64; ns],
        };

        let exact: Vec<f64> = props.iter().map(|&p| n_cells as f64 * p).collect();
        let mut counts: Vec<usize> = exact
            .iter()
            .map(|&x| (x + 1e-9).floor() as usize)
            .collect();

        // the remainder goes to the largest fractional parts, never to a
        // sample with a zero share; ties keep the sample order
        let mut order: Vec<usize> = (0..ns).filter(|&s| props[s] > 0.0).collect();
        order.sort_by(|&a, &b| {
            let frac_a = exact[a] - counts[a] as f64;
            let frac_b = exact[b] - counts[b] as f64;
            frac_b.total_cmp(&frac_a)
        });

        let mut assigned: usize = counts.iter().sum();
        for &s in order.iter().cycle() {
            if assigned >= n_cells {
                break;
            }
            counts[s] += 1;
            assigned += 1;
        }
        // rounding can never overshoot unless shares exceed 1
        while assigned > n_cells {
            if let Some(c) = counts.iter_mut().rev().find(|c| **c > 0) {
                *c -= 1;
            }
            assigned -= 1;
        }
        Ok(counts)
    }
}

/// Sample `n_cells` cells (rows of all their bins) from the table
///
/// * `spike_in` - draw from each sample of origin by share if given
/// * `seed` - random seed
pub fn subsample_cells(
    table: CnTable,
    n_cells: usize,
    spike_in: Option<&SpikeIn>,
    seed: u64,
) -> anyhow::Result<CnTable> {
    let mut rng = SmallRng::seed_from_u64(seed);
    match spike_in {
        Some(spike_in) => subsample_spike_in(table, n_cells, spike_in, &mut rng),
        None => subsample_uniform(table, n_cells, &mut rng),
    }
}

pub fn subsample_uniform(
    mut table: CnTable,
    n_cells: usize,
    rng: &mut SmallRng,
) -> anyhow::Result<CnTable> {
    let cells = table.cell_ids();

    if n_cells >= cells.len() {
        if n_cells > cells.len() {
            warn!(
                "asked for {} cells, but only {} available; keeping all",
                n_cells,
                cells.len()
            );
        }
        return Ok(table);
    }

    let selected: HashSet<Box<str>> = rand::seq::index::sample(rng, cells.len(), n_cells)
        .into_iter()
        .map(|i| cells[i].clone())
        .collect();

    table.retain(|r| selected.contains(&r.cell_id));
    info!("sampled {} of {} cells", n_cells, cells.len());
    Ok(table)
}

pub fn subsample_spike_in(
    mut table: CnTable,
    n_cells: usize,
    spike_in: &SpikeIn,
    rng: &mut SmallRng,
) -> anyhow::Result<CnTable> {
    let counts = spike_in.counts(n_cells)?;
    let origin = cell_origins(&table, &spike_in.sample_ids);

    // eligible cells per sample, in sorted cell order
    let mut eligible: Vec<Vec<Box<str>>> = vec![vec![]; spike_in.sample_ids.len()];
    for cell in table.cell_ids() {
        if let Some(&s) = origin.get(&cell) {
            eligible[s].push(cell);
        }
    }

    let mut selected: HashMap<Box<str>, usize> = HashMap::default();
    for (s, (&nn, cells)) in counts.iter().zip(eligible.iter()).enumerate() {
        let id = &spike_in.sample_ids[s];
        if cells.len() < nn {
            anyhow::bail!(
                "sample {} has {} cells, but {} are needed",
                id,
                cells.len(),
                nn
            );
        }
        for i in rand::seq::index::sample(rng, cells.len(), nn).into_iter() {
            selected.insert(cells[i].clone(), s);
        }
        info!("spike-in: {} cells from {}", nn, id);
    }

    table.retain(|r| selected.contains_key(&r.cell_id));
    table.set_extra_column(ORIGIN_COLUMN, |r| {
        selected
            .get(&r.cell_id)
            .map(|&s| spike_in.sample_ids[s].clone())
            .unwrap_or_default()
    });
    Ok(table)
}

/// Sample of origin for each cell: the `sample_id` column if present,
/// else the longest sample id that is the cell id itself or prefixes it
/// as `{id}-...`
fn cell_origins(table: &CnTable, sample_ids: &[Box<str>]) -> HashMap<Box<str>, usize> {
    let mut ret = HashMap::default();

    if let Some(k) = table.extra_column(SAMPLE_COLUMN) {
        for r in table.rows.iter() {
            if ret.contains_key(&r.cell_id) {
                continue;
            }
            if let Some(s) = sample_ids.iter().position(|x| *x == r.extra[k]) {
                ret.insert(r.cell_id.clone(), s);
            }
        }
        return ret;
    }

    for cell in table.cell_ids() {
        let best = sample_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| {
                let id: &str = id;
                *cell == *id
                    || cell
                        .strip_prefix(id)
                        .is_some_and(|rest| rest.starts_with('-'))
            })
            .max_by_key(|(_, id)| id.len());
        if let Some((s, _)) = best {
            ret.insert(cell, s);
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cn_table::CnRecord;

    fn record(cell: &str, end: u64, extra: Vec<&str>) -> CnRecord {
        CnRecord {
            chr: "1".into(),
            start: end - 99,
            end,
            cell_id: cell.into(),
            copy: Some(2.0),
            extra: extra.into_iter().map(|x| x.into()).collect(),
        }
    }

    /// `n` cells per sample, two bins each
    fn table_by_prefix(samples: &[&str], n: usize) -> CnTable {
        let mut rows = vec![];
        for s in samples {
            for i in 0..n {
                let cell = format!("{}-{}", s, i);
                rows.push(record(&cell, 100, vec![]));
                rows.push(record(&cell, 200, vec![]));
            }
        }
        CnTable::new(vec![], rows).unwrap()
    }

    fn spike(ids: &[&str], props: Option<Vec<f64>>) -> SpikeIn {
        SpikeIn {
            sample_ids: ids.iter().map(|&x| x.into()).collect(),
            proportions: props,
        }
    }

    #[test]
    fn test_uniform_cardinality() -> anyhow::Result<()> {
        let t = table_by_prefix(&["S"], 10);
        let all = t.cell_ids();

        let sub = subsample_cells(t.clone(), 4, None, 42)?;
        let cells = sub.cell_ids();
        assert_eq!(cells.len(), 4);
        assert!(cells.iter().all(|c| all.contains(c)));
        // every bin of a selected cell is kept
        assert_eq!(sub.num_rows(), 8);

        let sub = subsample_cells(t.clone(), 25, None, 42)?;
        assert_eq!(sub.cell_ids().len(), 10);
        Ok(())
    }

    #[test]
    fn test_uniform_is_seeded() -> anyhow::Result<()> {
        let t = table_by_prefix(&["S"], 20);
        let a = subsample_cells(t.clone(), 5, None, 7)?.cell_ids();
        let b = subsample_cells(t.clone(), 5, None, 7)?.cell_ids();
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_counts() -> anyhow::Result<()> {
        assert_eq!(spike(&["a", "b", "c"], None).counts(10)?, vec![4, 3, 3]);
        assert_eq!(
            spike(&["a", "b"], Some(vec![0.7, 0.3])).counts(10)?,
            vec![7, 3]
        );
        assert_eq!(
            spike(&["a", "b"], Some(vec![0.25, 0.75])).counts(7)?,
            vec![2, 5]
        );
        // zero shares never receive the remainder
        assert_eq!(
            spike(&["a", "b", "c"], Some(vec![0.0, 0.5, 0.5])).counts(3)?,
            vec![0, 2, 1]
        );
        assert_eq!(
            spike(&["a", "b", "c"], Some(vec![0.0, 0.0, 1.0])).counts(5)?,
            vec![0, 0, 5]
        );
        // largest fractional part first
        assert_eq!(
            spike(&["a", "b", "c"], Some(vec![0.2, 0.1, 0.7])).counts(4)?,
            vec![1, 0, 3]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_proportions() {
        assert!(spike(&[], None).validate().is_err());
        assert!(spike(&["a", "a"], None).validate().is_err());
        assert!(spike(&["a", "b"], Some(vec![1.0])).validate().is_err());
        assert!(spike(&["a", "b"], Some(vec![1.2, -0.2])).validate().is_err());
        assert!(spike(&["a", "b"], Some(vec![0.5, 0.6])).validate().is_err());
        assert!(spike(&["a", "b"], Some(vec![0.5, 0.5])).validate().is_ok());
    }

    #[test]
    fn test_spike_in_by_prefix() -> anyhow::Result<()> {
        let t = table_by_prefix(&["S1", "S2", "S3"], 6);
        let s = spike(&["S1", "S2"], Some(vec![0.75, 0.25]));
        let sub = subsample_cells(t, 8, Some(&s), 42)?;

        let k = sub.extra_column(ORIGIN_COLUMN).unwrap();
        let cells = sub.cell_ids();
        assert_eq!(cells.len(), 8);
        assert_eq!(cells.iter().filter(|c| c.starts_with("S1-")).count(), 6);
        assert_eq!(cells.iter().filter(|c| c.starts_with("S2-")).count(), 2);

        for r in sub.rows.iter() {
            assert!(r.cell_id.starts_with(&format!("{}-", r.extra[k])));
        }
        Ok(())
    }

    #[test]
    fn test_spike_in_by_sample_column() -> anyhow::Result<()> {
        let mut rows = vec![];
        for i in 0..4 {
            rows.push(record(&format!("c{}", i), 100, vec!["P"]));
            rows.push(record(&format!("d{}", i), 100, vec!["Q"]));
        }
        let t = CnTable::new(vec![SAMPLE_COLUMN.into()], rows)?;
        let sub = subsample_cells(t, 4, Some(&spike(&["P", "Q"], None)), 1)?;

        let k = sub.extra_column(ORIGIN_COLUMN).unwrap();
        assert_eq!(sub.num_rows(), 4);
        assert_eq!(sub.rows.iter().filter(|r| r.extra[k].as_ref() == "P").count(), 2);
        for r in sub.rows.iter() {
            assert_eq!(r.extra[k], r.extra[0]);
        }
        Ok(())
    }

    #[test]
    fn test_spike_in_sample_too_small() {
        let t = table_by_prefix(&["S1", "S2"], 3);
        let s = spike(&["S1", "S2"], Some(vec![0.9, 0.1]));
        let err = subsample_cells(t, 5, Some(&s), 0).err().unwrap();
        assert!(err.to_string().contains("S1"));

        let t = table_by_prefix(&["S1"], 3);
        assert!(subsample_cells(t, 2, Some(&spike(&["X", "S1"], None)), 0).is_err());
    }

    #[test]
    fn test_prefix_prefers_longest_id() {
        let t = table_by_prefix(&["S1", "S1-B"], 1);
        let origins = cell_origins(&t, &["S1".into(), "S1-B".into()]);
        assert_eq!(origins.get("S1-0"), Some(&0));
        assert_eq!(origins.get("S1-B-0"), Some(&1));
    }
}
