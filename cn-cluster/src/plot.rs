//! Scatter and heatmap renderers
//!
//! The heatmap orders bins along the genome and cells by cluster, then
//! within each cluster by the leaf order of a complete-linkage tree on
//! cityblock distances between the cells' profiles.

use crate::cluster::{ClusterAssignments, ClusteredCnTable};
use crate::cn_matrix::BinKey;
use crate::common::*;
use matrix_util::linkage::complete_linkage;
use matrix_util::traits::DistanceOps;
use plotters::prelude::*;

pub trait ScatterRenderer {
    /// Draw each cell at its embedding coordinates coloured by cluster
    fn draw_scatter(
        &self,
        path: &str,
        size: (u32, u32),
        assignments: &ClusterAssignments,
    ) -> anyhow::Result<()>;
}

pub trait HeatmapRenderer {
    /// Draw the clustered CN heatmap and return the matrix as drawn
    fn draw_heatmap(
        &self,
        path: &str,
        size: (u32, u32),
        table: &ClusteredCnTable,
        options: &HeatmapOptions,
    ) -> anyhow::Result<HeatmapMatrix>;
}

#[derive(Debug, Clone)]
pub struct HeatmapOptions {
    pub value_field: Box<str>,
    pub cluster_field: Box<str>,
    /// explicit within-cluster cell order, replacing the linkage tree
    pub linkage: Option<Vec<Box<str>>>,
    /// column annotated as a second colour strip
    pub origin_field: Option<Box<str>>,
    /// continuous colour scale if true, copy-number states otherwise
    pub raw: bool,
    /// bins as rows and cells as columns
    pub flip: bool,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        Self {
            value_field: "copy".into(),
            cluster_field: CLUSTER_COLUMN.into(),
            linkage: None,
            origin_field: None,
            raw: true,
            flip: false,
        }
    }
}

/// The heatmap grid in display order
#[derive(Debug, Clone)]
pub struct HeatmapMatrix {
    pub bins: Vec<BinKey>,
    pub cells: Vec<Box<str>>,
    /// cluster of each cell in `cells`
    pub clusters: Vec<i32>,
    pub origins: Option<Vec<Box<str>>>,
    /// cells × bins, or bins × cells if `flipped`
    pub values: Mat,
    pub flipped: bool,
}

impl HeatmapMatrix {
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn value(&self, cell: usize, bin: usize) -> f32 {
        if self.flipped {
            self.values[(bin, cell)]
        } else {
            self.values[(cell, bin)]
        }
    }
}

/// Sort key of a chromosome name: 1..22, X, Y, then the rest
/// lexicographically; a `chr` prefix is ignored
pub fn chromosome_rank(chr: &str) -> (u32, &str) {
    let name = chr.strip_prefix("chr").unwrap_or(chr);
    match name {
        "X" => (23, ""),
        "Y" => (24, ""),
        _ => match name.parse::<u32>() {
            Ok(n) if (1..=22).contains(&n) => (n, ""),
            _ => (25, name),
        },
    }
}

/// Reshape the clustered table into the heatmap grid in display order
pub fn order_heatmap(
    table: &ClusteredCnTable,
    options: &HeatmapOptions,
) -> anyhow::Result<HeatmapMatrix> {
    let values = table.numeric_field(&options.value_field)?;
    let clusters = table.cluster_field(&options.cluster_field)?;
    let origins = options
        .origin_field
        .as_ref()
        .map(|f| table.text_field(f))
        .transpose()?;

    let rows = &table.table.rows;
    anyhow::ensure!(!rows.is_empty(), "nothing to draw in an empty table");

    let mut bins: Vec<BinKey> = rows
        .iter()
        .map(|r| BinKey {
            chr: r.chr.clone(),
            start: r.start,
            end: r.end,
        })
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    bins.sort_by(|a, b| {
        chromosome_rank(&a.chr)
            .cmp(&chromosome_rank(&b.chr))
            .then(a.start.cmp(&b.start))
            .then(a.end.cmp(&b.end))
    });
    let bin_index: HashMap<&BinKey, usize> =
        bins.iter().enumerate().map(|(i, b)| (b, i)).collect();

    let cells = table.table.cell_ids();
    let cell_index: HashMap<&str, usize> = cells
        .iter()
        .enumerate()
        .map(|(j, c)| (&**c, j))
        .collect();

    let nc = cells.len();
    let nb = bins.len();

    let mut cell_cluster: Vec<Option<i32>> = vec![None; nc];
    let mut cell_origin: Vec<Box<str>> = vec!["".into(); nc];
    let mut grid = Mat::zeros(nc, nb);

    for (r, row) in rows.iter().enumerate() {
        let j = cell_index[&*row.cell_id];
        let key = BinKey {
            chr: row.chr.clone(),
            start: row.start,
            end: row.end,
        };
        let i = bin_index[&key];

        match cell_cluster[j] {
            Some(k) if k != clusters[r] => {
                anyhow::bail!("cell {} is in clusters {} and {}", row.cell_id, k, clusters[r])
            }
            Some(_) => {}
            None => {
                cell_cluster[j] = Some(clusters[r]);
                if let Some(o) = &origins {
                    cell_origin[j] = o[r].clone();
                }
            }
        }

        grid[(j, i)] = values[r].unwrap_or(0.0);
    }

    let cell_cluster: Vec<i32> = cell_cluster.into_iter().map(|k| k.unwrap_or(-1)).collect();

    let mut cluster_ids = cell_cluster.clone();
    cluster_ids.sort_unstable();
    cluster_ids.dedup();

    let override_rank: Option<HashMap<&str, usize>> = options
        .linkage
        .as_ref()
        .map(|order| order.iter().enumerate().map(|(k, c)| (&**c, k)).collect());

    let mut order: Vec<usize> = Vec::with_capacity(nc);
    for &k in cluster_ids.iter() {
        let members: Vec<usize> = (0..nc).filter(|&j| cell_cluster[j] == k).collect();

        if let Some(rank) = &override_rank {
            let mut ranked = Vec::with_capacity(members.len());
            for &j in members.iter() {
                let pos = rank.get(&*cells[j]).ok_or(anyhow::anyhow!(
                    "cell {} is missing from the linkage order",
                    cells[j]
                ))?;
                ranked.push((*pos, j));
            }
            ranked.sort_unstable();
            order.extend(ranked.into_iter().map(|(_, j)| j));
        } else if members.len() > 2 {
            let sub = Mat::from_fn(members.len(), nb, |a, b| grid[(members[a], b)]);
            let tree = complete_linkage(&sub.cityblock_row_distances())?;
            order.extend(tree.leaves().into_iter().map(|a| members[a]));
        } else {
            order.extend(members);
        }
    }

    let ordered = Mat::from_fn(nc, nb, |a, b| grid[(order[a], b)]);

    Ok(HeatmapMatrix {
        bins,
        cells: order.iter().map(|&j| cells[j].clone()).collect(),
        clusters: order.iter().map(|&j| cell_cluster[j]).collect(),
        origins: origins.map(|_| order.iter().map(|&j| cell_origin[j].clone()).collect()),
        values: if options.flip {
            ordered.transpose()
        } else {
            ordered
        },
        flipped: options.flip,
    })
}

const NOISE_COLOR: RGBColor = RGBColor(190, 190, 190);

const CLUSTER_PALETTE: [RGBColor; 10] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
    RGBColor(188, 189, 34),
    RGBColor(23, 190, 207),
];

const ORIGIN_PALETTE: [RGBColor; 8] = [
    RGBColor(102, 194, 165),
    RGBColor(252, 141, 98),
    RGBColor(141, 160, 203),
    RGBColor(231, 138, 195),
    RGBColor(166, 216, 84),
    RGBColor(255, 217, 47),
    RGBColor(229, 196, 148),
    RGBColor(179, 179, 179),
];

/// copy-number states 0..=11
const CN_PALETTE: [RGBColor; 12] = [
    RGBColor(49, 130, 189),
    RGBColor(158, 202, 225),
    RGBColor(204, 204, 204),
    RGBColor(253, 204, 138),
    RGBColor(252, 141, 89),
    RGBColor(227, 74, 51),
    RGBColor(179, 0, 0),
    RGBColor(152, 0, 67),
    RGBColor(221, 28, 119),
    RGBColor(223, 101, 176),
    RGBColor(201, 148, 199),
    RGBColor(212, 185, 218),
];

const CONTINUOUS_STOPS: [(f32, f32, f32); 5] = [
    (68., 1., 84.),
    (59., 82., 139.),
    (33., 145., 140.),
    (94., 201., 98.),
    (253., 231., 37.),
];

pub fn cluster_color(k: i32) -> RGBColor {
    if k < 0 {
        NOISE_COLOR
    } else {
        CLUSTER_PALETTE[k as usize % CLUSTER_PALETTE.len()]
    }
}

/// Nearest state, clipped to the palette
pub fn state_color(x: f32) -> RGBColor {
    let s = if x.is_finite() {
        x.round().clamp(0.0, (CN_PALETTE.len() - 1) as f32) as usize
    } else {
        0
    };
    CN_PALETTE[s]
}

pub fn continuous_color(x: f32, lo: f32, hi: f32) -> RGBColor {
    let t = if hi > lo && x.is_finite() {
        ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let pos = t * (CONTINUOUS_STOPS.len() - 1) as f32;
    let k = (pos.floor() as usize).min(CONTINUOUS_STOPS.len() - 2);
    let f = pos - k as f32;
    let (a, b) = (CONTINUOUS_STOPS[k], CONTINUOUS_STOPS[k + 1]);
    let mix = |u: f32, v: f32| (u + (v - u) * f).round() as u8;
    RGBColor(mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

/// Labels need a system font; without one figures are drawn unlabelled
fn labels_available() -> bool {
    match ("sans-serif", 12).into_font().box_size("0") {
        Ok(_) => true,
        Err(e) => {
            warn!("no font for plot labels ({:?}), drawing without them", e);
            false
        }
    }
}

pub struct PlottersScatter;

impl ScatterRenderer for PlottersScatter {
    fn draw_scatter(
        &self,
        path: &str,
        size: (u32, u32),
        assignments: &ClusterAssignments,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!assignments.is_empty(), "no cells to draw");

        let (xr, yr) = padded_ranges(assignments);

        let root = BitMapBackend::new(path, size).into_drawing_area();
        root.fill(&WHITE)?;

        let labelled = labels_available();

        let mut builder = ChartBuilder::on(&root);
        builder.margin(10);
        if labelled {
            builder
                .caption("UMAP + HDBSCAN clusters", ("sans-serif", 24))
                .x_label_area_size(40)
                .y_label_area_size(50);
        }
        let mut chart = builder.build_cartesian_2d(xr, yr)?;

        if labelled {
            chart
                .configure_mesh()
                .disable_mesh()
                .x_desc("UMAP 1")
                .y_desc("UMAP 2")
                .draw()?;
        }

        for k in assignments.distinct_clusters() {
            let color = cluster_color(k);
            let label = if k < 0 {
                "noise".to_string()
            } else {
                k.to_string()
            };
            chart
                .draw_series(
                    assignments
                        .assignments
                        .iter()
                        .filter(|a| a.cluster_id == k)
                        .map(|a| Circle::new((a.umap1, a.umap2), 3, color.mix(0.8).filled())),
                )?
                .label(label)
                .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
        }

        if labelled {
            chart
                .configure_series_labels()
                .position(SeriesLabelPosition::UpperRight)
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }

        root.present()?;
        info!("wrote {}", path);
        Ok(())
    }
}

fn padded_ranges(assignments: &ClusterAssignments) -> (std::ops::Range<f32>, std::ops::Range<f32>) {
    let range = |xs: Vec<f32>| {
        let lo = xs.iter().cloned().fold(f32::INFINITY, f32::min);
        let hi = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let pad = ((hi - lo) * 0.05).max(0.5);
        (lo - pad)..(hi + pad)
    };
    (
        range(assignments.assignments.iter().map(|a| a.umap1).collect()),
        range(assignments.assignments.iter().map(|a| a.umap2).collect()),
    )
}

pub struct PlottersHeatmap;

const MARGIN: i32 = 10;
const TITLE_SIZE: i32 = 30;
const LABEL_SIZE: i32 = 24;
const STRIP_WIDTH: i32 = 12;
const STRIP_GAP: i32 = 3;

impl HeatmapRenderer for PlottersHeatmap {
    fn draw_heatmap(
        &self,
        path: &str,
        size: (u32, u32),
        table: &ClusteredCnTable,
        options: &HeatmapOptions,
    ) -> anyhow::Result<HeatmapMatrix> {
        let hm = order_heatmap(table, options)?;

        let root = BitMapBackend::new(path, size).into_drawing_area();
        root.fill(&WHITE)?;

        let (w, h) = (size.0 as i32, size.1 as i32);
        let flip = hm.flipped;
        let labelled = labels_available();

        let n_strips = if hm.origins.is_some() { 2 } else { 1 };
        let lead = n_strips * (STRIP_WIDTH + STRIP_GAP);

        // grid corners; cells run along y unless flipped
        let (gx0, gy0, gx1, gy1) = if flip {
            (MARGIN + LABEL_SIZE * 2, MARGIN + TITLE_SIZE + lead, w - MARGIN, h - MARGIN)
        } else {
            (MARGIN + lead, MARGIN + TITLE_SIZE, w - MARGIN, h - MARGIN - LABEL_SIZE)
        };
        anyhow::ensure!(gx1 > gx0 && gy1 > gy0, "figure {:?} is too small", size);

        let (cell_len, bin_len) = if flip {
            (gx1 - gx0, gy1 - gy0)
        } else {
            (gy1 - gy0, gx1 - gx0)
        };
        let to_xy = |cp: i32, bp: i32| {
            if flip {
                (gx0 + cp, gy0 + bp)
            } else {
                (gx0 + bp, gy0 + cp)
            }
        };

        let nc = hm.num_cells();
        let nb = hm.num_bins();
        let cell_at = |cp: i32| (cp as usize * nc) / cell_len as usize;
        let bin_at = |bp: i32| (bp as usize * nb) / bin_len as usize;

        let (lo, hi) = hm
            .values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| {
                (lo.min(x), hi.max(x))
            });

        for cp in 0..cell_len {
            let c = cell_at(cp);
            for bp in 0..bin_len {
                let x = hm.value(c, bin_at(bp));
                let color = if options.raw {
                    continuous_color(x, lo, hi)
                } else {
                    state_color(x)
                };
                root.draw_pixel(to_xy(cp, bp), &color)?;
            }
        }

        // cluster and origin strips
        let origin_levels: Vec<&str> = match &hm.origins {
            Some(o) => {
                let mut levels: Vec<&str> = o.iter().map(|x| &**x).collect();
                levels.sort_unstable();
                levels.dedup();
                levels
            }
            None => vec![],
        };

        for cp in 0..cell_len {
            let c = cell_at(cp);
            let mut colors = vec![cluster_color(hm.clusters[c])];
            if let Some(o) = &hm.origins {
                let level = origin_levels.iter().position(|&l| l == &*o[c]).unwrap_or(0);
                colors.push(ORIGIN_PALETTE[level % ORIGIN_PALETTE.len()]);
            }
            for (s, color) in colors.iter().enumerate() {
                let offset = s as i32 * (STRIP_WIDTH + STRIP_GAP);
                for t in 0..STRIP_WIDTH {
                    let pt = if flip {
                        (gx0 + cp, MARGIN + TITLE_SIZE + offset + t)
                    } else {
                        (MARGIN + offset + t, gy0 + cp)
                    };
                    root.draw_pixel(pt, color)?;
                }
            }
        }

        // chromosome separators and labels
        let label_font = ("sans-serif", 12).into_font();
        let mut seg_start = 0;
        for b in 1..=nb {
            if b < nb && hm.bins[b].chr == hm.bins[b - 1].chr {
                continue;
            }
            let p0 = (seg_start * bin_len as usize / nb) as i32;
            let p1 = (b * bin_len as usize / nb) as i32;
            let mid = (p0 + p1) / 2;
            let chr = hm.bins[seg_start].chr.to_string();
            let chr = chr.strip_prefix("chr").unwrap_or(&chr).to_string();

            if labelled {
                let pos = if flip {
                    (MARGIN, gy0 + mid)
                } else {
                    (gx0 + mid, gy1 + 6)
                };
                root.draw(&Text::new(chr, pos, label_font.clone()))?;
            }

            if b < nb {
                let line = if flip {
                    vec![(gx0, gy0 + p1), (gx1, gy0 + p1)]
                } else {
                    vec![(gx0 + p1, gy0), (gx0 + p1, gy1)]
                };
                root.draw(&PathElement::new(line, BLACK.stroke_width(1)))?;
            }
            seg_start = b;
        }

        if labelled {
            let title = format!(
                "{} by {} ({} cells)",
                options.value_field, options.cluster_field, nc
            );
            root.draw(&Text::new(
                title,
                (MARGIN, MARGIN),
                ("sans-serif", 20).into_font(),
            ))?;
        }

        root.present()?;
        info!("wrote {}", path);
        Ok(hm)
    }
}
