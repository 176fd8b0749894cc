use crate::cn_table::CnTable;
use crate::common::*;
use nalgebra::DMatrix;

/// A genomic bin; ordered by `chr` (lexicographic), `start`, `end`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinKey {
    pub chr: Box<str>,
    pub start: u64,
    pub end: u64,
}

impl std::fmt::Display for BinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.chr, self.start, self.end)
    }
}

/// Dense bins × cells copy-number matrix
#[derive(Debug, Clone)]
pub struct CnMatrix {
    pub bins: Vec<BinKey>,
    pub cells: Vec<Box<str>>,
    /// bins × cells; absent or missing values are 0
    pub values: Mat,
    observed: DMatrix<bool>,
}

impl CnMatrix {
    /// Pivot the long table: sorted bins as rows, sorted cell ids as
    /// columns
    pub fn from_table(table: &CnTable) -> anyhow::Result<Self> {
        let mut bins: Vec<BinKey> = table
            .rows
            .iter()
            .map(|r| BinKey {
                chr: r.chr.clone(),
                start: r.start,
                end: r.end,
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        bins.sort();

        let cells = table.cell_ids();

        let bin_index: HashMap<&BinKey, usize> =
            bins.iter().enumerate().map(|(i, b)| (b, i)).collect();
        let cell_index: HashMap<&str, usize> = cells
            .iter()
            .enumerate()
            .map(|(j, c)| (&**c, j))
            .collect();

        let (nb, nc) = (bins.len(), cells.len());
        let mut values = Mat::zeros(nb, nc);
        let mut observed = DMatrix::from_element(nb, nc, false);
        let mut seen = DMatrix::from_element(nb, nc, false);

        for r in table.rows.iter() {
            let key = BinKey {
                chr: r.chr.clone(),
                start: r.start,
                end: r.end,
            };
            let i = bin_index[&key];
            let j = cell_index[&*r.cell_id];
            if seen[(i, j)] {
                anyhow::bail!("duplicate CN record: {} in cell {}", key, r.cell_id);
            }
            seen[(i, j)] = true;

            if let Some(x) = r.copy {
                values[(i, j)] = x;
                observed[(i, j)] = true;
            }
        }

        info!("CN matrix: {} bins x {} cells", nb, nc);

        Ok(Self {
            bins,
            cells,
            values,
            observed,
        })
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Cells as rows, for clustering
    pub fn cells_by_bins(&self) -> Mat {
        self.values.transpose()
    }

    /// Back to (bin, cell, copy) triples, bin-major, for the entries that
    /// had a value in the source table
    pub fn to_long(&self) -> Vec<(BinKey, Box<str>, f32)> {
        let mut ret = vec![];
        for (i, bin) in self.bins.iter().enumerate() {
            for (j, cell) in self.cells.iter().enumerate() {
                if self.observed[(i, j)] {
                    ret.push((bin.clone(), cell.clone(), self.values[(i, j)]));
                }
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
chr,start,end,cell_id,copy
2,1,100,B,3
1,101,200,A,2
1,1,100,A,1
10,1,100,A,5
1,1,100,B,
";

    #[test]
    fn test_pivot_order_and_fill() -> anyhow::Result<()> {
        let table = CnTable::from_reader(CSV.as_bytes())?;
        let cn = CnMatrix::from_table(&table)?;

        let chrs: Vec<&str> = cn.bins.iter().map(|b| &*b.chr).collect();
        // lexicographic: "10" sorts before "2"
        assert_eq!(chrs, vec!["1", "1", "10", "2"]);
        assert_eq!(cn.bins[0].start, 1);
        assert_eq!(cn.bins[1].start, 101);
        let cells: Vec<&str> = cn.cells.iter().map(|c| &**c).collect();
        assert_eq!(cells, vec!["A", "B"]);

        assert_eq!(cn.values.shape(), (4, 2));
        assert_eq!(cn.values[(0, 0)], 1.0);
        assert_eq!(cn.values[(1, 0)], 2.0);
        assert_eq!(cn.values[(2, 0)], 5.0);
        assert_eq!(cn.values[(3, 1)], 3.0);
        // absent or missing
        assert_eq!(cn.values[(0, 1)], 0.0);
        assert_eq!(cn.values[(1, 1)], 0.0);
        assert_eq!(cn.values[(3, 0)], 0.0);

        assert_eq!(cn.cells_by_bins().shape(), (2, 4));
        Ok(())
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let table = CnTable::from_reader(CSV.as_bytes())?;
        let cn = CnMatrix::from_table(&table)?;

        let mut expected: Vec<(BinKey, Box<str>, f32)> = table
            .rows
            .iter()
            .filter_map(|r| {
                r.copy.map(|x| {
                    (
                        BinKey {
                            chr: r.chr.clone(),
                            start: r.start,
                            end: r.end,
                        },
                        r.cell_id.clone(),
                        x,
                    )
                })
            })
            .collect();
        expected.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        assert_eq!(cn.to_long(), expected);
        Ok(())
    }

    #[test]
    fn test_duplicate_key() {
        let csv = "chr,start,end,cell_id,copy\n1,1,100,A,2\n1,1,100,A,3\n";
        let table = CnTable::from_reader(csv.as_bytes()).unwrap();
        let err = CnMatrix::from_table(&table).err().unwrap();
        assert!(err.to_string().contains("1:1-100"));
    }
}
