use crate::cn_table::CnTable;
use crate::common::*;

/// The `n_bins`-th smallest distinct `end` coordinate (1-based),
/// or the largest one if there are fewer distinct ends
pub fn bin_end_threshold(table: &CnTable, n_bins: usize) -> anyhow::Result<u64> {
    anyhow::ensure!(n_bins > 0, "number of bins must be positive");
    let ends = table.ends();
    let last = ends
        .len()
        .checked_sub(1)
        .ok_or(anyhow::anyhow!("no bins in an empty CN table"))?;
    Ok(ends[(n_bins - 1).min(last)])
}

/// Keep the rows whose `end` is at most the `n_bins`-th smallest
/// distinct `end`. Ends are compared across chromosomes.
pub fn restrict_bins(mut table: CnTable, n_bins: usize) -> anyhow::Result<CnTable> {
    let threshold = bin_end_threshold(&table, n_bins)?;
    info!("restricting to bins with end <= {}", threshold);

    let before = table.num_rows();
    table.retain(|r| r.end <= threshold);
    info!("kept {} of {} rows", table.num_rows(), before);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CnTable {
        let csv = "\
chr,start,end,cell_id,copy
1,1,100,A,2
1,101,200,A,2
1,201,300,A,3
2,1,100,A,2
2,101,150,A,1
1,1,100,B,2
1,101,200,B,4
";
        CnTable::from_reader(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_threshold() {
        let t = table();
        assert_eq!(t.ends(), vec![100, 150, 200, 300]);
        assert_eq!(bin_end_threshold(&t, 1).unwrap(), 100);
        assert_eq!(bin_end_threshold(&t, 3).unwrap(), 200);
        assert_eq!(bin_end_threshold(&t, 99).unwrap(), 300);
        assert!(bin_end_threshold(&t, 0).is_err());
    }

    #[test]
    fn test_restrict_is_monotonic() -> anyhow::Result<()> {
        let t = table();
        let ends = t.ends();
        let mut prev = 0;
        for n in 1..=ends.len() {
            let kept = restrict_bins(t.clone(), n)?;
            assert!(kept.rows.iter().all(|r| r.end <= ends[n - 1]));
            let expected = t.rows.iter().filter(|r| r.end <= ends[n - 1]).count();
            assert_eq!(kept.num_rows(), expected);
            assert!(kept.num_rows() >= prev);
            prev = kept.num_rows();
        }
        Ok(())
    }

    #[test]
    fn test_all_bins_keeps_table() -> anyhow::Result<()> {
        let t = table();
        let n = t.ends().len();
        let kept = restrict_bins(t.clone(), n)?;
        assert_eq!(kept.rows, t.rows);
        Ok(())
    }

    #[test]
    fn test_ties_across_cells_and_chromosomes() -> anyhow::Result<()> {
        let kept = restrict_bins(table(), 1)?;
        // end = 100 on chr1 (A, B) and chr2 (A)
        assert_eq!(kept.num_rows(), 3);
        Ok(())
    }

    #[test]
    fn test_empty_table() {
        let t = CnTable::new(vec![], vec![]).unwrap();
        assert!(restrict_bins(t, 3).is_err());
    }
}
