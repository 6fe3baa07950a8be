//! # frontier-rs
//!
//! $$
//! \min_{\mathbf w}\ \mathbf w^\top\Sigma\mathbf w\quad\text{s.t.}\quad \mathbf 1^\top\mathbf w=1,\ \boldsymbol\mu^\top\mathbf w=r^\*
//! $$
//!
//! Minimum-variance allocation, efficient frontiers, shrinkage of expected returns
//! and Monte Carlo resampled frontiers.

#![allow(clippy::too_many_arguments)]

pub mod portfolio;
