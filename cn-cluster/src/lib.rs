pub mod bins;
pub mod cli;
pub mod cluster;
pub mod cn_matrix;
pub mod cn_table;
pub mod common;
pub mod pipeline;
pub mod plot;
pub mod subsample;
