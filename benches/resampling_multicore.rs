use std::hint::black_box;
use std::time::Instant;

use frontier_rs::portfolio::resample_frontier;
use frontier_rs::portfolio::MinVarianceOptimizer;
use frontier_rs::portfolio::ResamplingConfig;
use frontier_rs::portfolio::ResamplingControl;
use frontier_rs::portfolio::ShrinkageEstimator;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::Normal;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;

fn median_ms(samples: &mut [f64]) -> f64 {
  samples.sort_by(f64::total_cmp);
  samples[samples.len() / 2]
}

/// `(assets, years)` panel of independent normal yearly returns.
fn yearly_panel(assets: usize, years: usize, seed: u64) -> Array2<f64> {
  let mut rng = StdRng::seed_from_u64(seed);
  let mut panel = Array2::<f64>::zeros((assets, years));
  for i in 0..assets {
    let dist = Normal::new(0.03 + 0.01 * i as f64, 0.05 + 0.02 * i as f64).expect("valid normal");
    for t in 0..years {
      panel[[i, t]] = dist.sample(&mut rng);
    }
  }
  panel
}

fn bench_pool(
  pool: &ThreadPool,
  panel: &Array2<f64>,
  config: &ResamplingConfig,
  warmup: usize,
  runs: usize,
) -> f64 {
  let optimizer = MinVarianceOptimizer::long_only();
  let estimate = ShrinkageEstimator::new(config.shrinkage_intensity)
    .expect("valid intensity")
    .estimate(panel)
    .expect("estimate");
  let control = ResamplingControl::new();

  let mut once = || {
    let mut rng = StdRng::seed_from_u64(config.seed);
    pool.install(|| {
      let out = resample_frontier(
        &optimizer,
        &estimate.shrunk_mean,
        &estimate.uncertainty_covariance,
        &estimate.sample_covariance,
        config,
        &control,
        &mut rng,
      );
      black_box(out.expect("resampling"));
    });
  };

  for _ in 0..warmup {
    once();
  }

  let mut times_ms = Vec::with_capacity(runs);
  for _ in 0..runs {
    let t0 = Instant::now();
    once();
    times_ms.push(t0.elapsed().as_secs_f64() * 1_000.0);
  }
  median_ms(&mut times_ms)
}

fn run_case(assets: usize, simulations: usize, single: &ThreadPool, multi: &ThreadPool) {
  let panel = yearly_panel(assets, 10, 7);
  let config = ResamplingConfig {
    num_simulations: simulations,
    ..ResamplingConfig::default()
  };
  let t1 = bench_pool(single, &panel, &config, 1, 5);
  let tn = bench_pool(multi, &panel, &config, 1, 5);
  let speedup = t1 / tn;
  let solves = simulations * config.num_portfolios;
  print!("assets={assets:<3} draws={simulations:<5} solves={solves:<7} | ");
  println!("1T={t1:>9.2} ms | MT={tn:>9.2} ms | speedup={speedup:>5.2}x");
}

fn main() {
  let threads = std::thread::available_parallelism()
    .map(|v| v.get())
    .unwrap_or(1);
  let mt_threads = threads.max(2);
  let single = ThreadPoolBuilder::new()
    .num_threads(1)
    .build()
    .expect("failed to build single-thread pool");
  let multi = ThreadPoolBuilder::new()
    .num_threads(mt_threads)
    .build()
    .expect("failed to build multi-thread pool");

  println!("Resampled frontier benchmark");
  println!("Using MT threads: {mt_threads}");
  println!();

  run_case(4, 200, &single, &multi);
  run_case(8, 200, &single, &multi);
  run_case(16, 100, &single, &multi);
}
