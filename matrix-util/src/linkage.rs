//! Complete-linkage agglomerative clustering and dendrogram leaf order
//!
//! Merges are found by the nearest-neighbour chain algorithm, which is
//! exact for complete linkage, then sorted by height and relabelled so
//! that the `k`-th merge creates cluster `n + k` (the usual linkage
//! matrix convention).

/// One agglomeration step
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    /// the child with the smaller cluster id
    pub left: usize,
    pub right: usize,
    pub height: f32,
    /// number of leaves under this node
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct Dendrogram {
    pub n_leaves: usize,
    pub merges: Vec<Merge>,
}

/// Complete-linkage clustering of a full symmetric distance matrix
///
/// * `dist` - `n x n` pairwise distances
///
pub fn complete_linkage(dist: &[Vec<f32>]) -> anyhow::Result<Dendrogram> {
    let nn = dist.len();
    for (i, row) in dist.iter().enumerate() {
        if row.len() != nn {
            anyhow::bail!("distance row {} has {} entries, expected {}", i, row.len(), nn);
        }
    }

    let mut dd: Vec<Vec<f32>> = dist.to_vec();
    let mut active = vec![true; nn];
    let mut raw_merges: Vec<(usize, usize, f32)> = Vec::with_capacity(nn.saturating_sub(1));
    let mut chain: Vec<usize> = Vec::with_capacity(nn);

    let mut remaining = nn;

    while remaining > 1 {
        if chain.is_empty() {
            if let Some(first) = active.iter().position(|&x| x) {
                chain.push(first);
            }
        }

        let (a, b) = loop {
            let a = chain[chain.len() - 1];
            let prev = if chain.len() >= 2 {
                Some(chain[chain.len() - 2])
            } else {
                None
            };

            let mut best: Option<(usize, f32)> = None;
            for c in 0..nn {
                if c == a || !active[c] {
                    continue;
                }
                let d = dd[a][c];
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((c, d));
                }
            }

            let Some((mut b, bd)) = best else {
                anyhow::bail!("no active neighbour for cluster {}", a);
            };

            // prefer the chain predecessor on ties, otherwise the chain
            // may cycle
            if let Some(p) = prev {
                if dd[a][p] <= bd {
                    b = p;
                }
            }

            if Some(b) == prev {
                break (a, b);
            }
            chain.push(b);
        };

        chain.pop();
        chain.pop();

        let height = dd[a][b];
        raw_merges.push((a, b, height));

        // Lance-Williams update for complete linkage; slot `a` keeps
        // the merged cluster
        for k in 0..nn {
            if active[k] && k != a && k != b {
                let d = dd[a][k].max(dd[b][k]);
                dd[a][k] = d;
                dd[k][a] = d;
            }
        }
        active[b] = false;
        remaining -= 1;
    }

    // stable sort by height, then relabel with union-find
    raw_merges.sort_by(|x, y| x.2.total_cmp(&y.2));

    let mut parent: Vec<usize> = (0..nn).collect();
    let mut cluster_of_root: Vec<usize> = (0..nn).collect();
    let mut leaves_of_root = vec![1usize; nn];

    fn find(parent: &mut [usize], x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = x;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }

    let mut merges = Vec::with_capacity(raw_merges.len());
    for (k, &(a, b, height)) in raw_merges.iter().enumerate() {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        let (ca, cb) = (cluster_of_root[ra], cluster_of_root[rb]);
        let merged_size = leaves_of_root[ra] + leaves_of_root[rb];

        parent[rb] = ra;
        cluster_of_root[ra] = nn + k;
        leaves_of_root[ra] = merged_size;

        merges.push(Merge {
            left: ca.min(cb),
            right: ca.max(cb),
            height,
            size: merged_size,
        });
    }

    Ok(Dendrogram {
        n_leaves: nn,
        merges,
    })
}

impl Dendrogram {
    /// Leaves from left to right, visiting `left` before `right`
    pub fn leaves(&self) -> Vec<usize> {
        let nn = self.n_leaves;
        if nn == 0 {
            return vec![];
        }
        if self.merges.is_empty() {
            return (0..nn).collect();
        }

        let mut ret = Vec::with_capacity(nn);
        let mut stack = vec![nn + self.merges.len() - 1];
        while let Some(node) = stack.pop() {
            if node < nn {
                ret.push(node);
            } else {
                let m = &self.merges[node - nn];
                stack.push(m.right);
                stack.push(m.left);
            }
        }
        ret
    }
}
