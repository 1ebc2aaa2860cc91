use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nalgebra::{DMatrix, DVector, Vector3};
use nav_estimation::calibration::{hard_iron_offset, still_bias, ImuBiases};
use nav_estimation::integrator::rk4_step;
use nav_estimation::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Subcommand, Debug)]
enum Command {
    /// Run the AHRS filter over a recorded IMU log
    Ahrs(AhrsArgs),
    /// Track a simulated damped pendulum with the EKF
    EkfDemo(EkfDemoArgs),
}

#[derive(Clone, Args, Debug)]
struct AhrsArgs {
    /// CSV log with columns time,ax,ay,az,gx,gy,gz,mx,my,mz
    #[arg(short, long)]
    input: PathBuf,

    /// File to write orientation estimates to
    #[arg(short, long, default_value = "orientation.csv")]
    output: PathBuf,

    /// Gradient step gain
    #[arg(short, long, default_value_t = DEFAULT_BETA)]
    beta: f32,

    /// Number of leading still-stand samples used to estimate gyro bias
    #[arg(long, default_value_t = 0)]
    still_samples: usize,

    /// Remove a min/max hard-iron offset from the magnetometer
    #[arg(long)]
    hard_iron: bool,

    /// Seed the orientation from the first accelerometer/magnetometer sample
    #[arg(long)]
    seed: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Propagation {
    Continuous,
    Discretized,
}

impl From<Propagation> for CovariancePropagation {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Continuous => CovariancePropagation::Continuous,
            Propagation::Discretized => CovariancePropagation::Discretized,
        }
    }
}

#[derive(Clone, Args, Debug)]
struct EkfDemoArgs {
    #[arg(long, default_value_t = 200)]
    steps: usize,

    /// Time step in seconds
    #[arg(long, default_value_t = 0.05)]
    dt: f64,

    /// Standard deviation of the simulated measurement noise
    #[arg(long, default_value_t = 0.05)]
    noise: f64,

    /// Random seed for the measurement noise
    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = Propagation::Discretized)]
    propagation: Propagation,
}

/// Damped pendulum, state `[angle, rate]`.
#[derive(Clone, Copy, Debug)]
struct Pendulum {
    gravity_over_length: f64,
    damping: f64,
}

impl Dynamics for Pendulum {
    fn derivative(
        &self,
        _time: f64,
        state: &DVector<f64>,
        _control: &DVector<f64>,
    ) -> DVector<f64> {
        DVector::from_vec(vec![
            state[1],
            -self.gravity_over_length * state[0].sin() - self.damping * state[1],
        ])
    }
}

fn run_ahrs(args: AhrsArgs) -> Result<()> {
    let data: Vec<RawImuData> = read_csv(&args.input)
        .with_context(|| format!("Failed to read IMU log {}", args.input.display()))?;
    if data.len() < 2 {
        bail!("IMU log {} needs at least two samples", args.input.display());
    }

    let mut biases = ImuBiases::default();
    if args.still_samples > 0 {
        let window: Vec<Vector3<f32>> = data
            .iter()
            .take(args.still_samples)
            .map(|raw| Vector3::new(raw.gx, raw.gy, raw.gz))
            .collect();
        biases.gyro = still_bias(&window)?;
    }
    if args.hard_iron {
        let mags: Vec<Vector3<f32>> = data.iter().map(RawImuData::mag).collect();
        biases.mag = hard_iron_offset(&mags)?;
    }
    info!(?biases, "Calibration");

    let corrected: Vec<RawImuData> = data.iter().map(|raw| biases.correct(raw)).collect();
    let first = &corrected[0];
    let mut ahrs = if args.seed {
        AhrsFilter::with_orientation(orientation_accel_mag(first.accel(), first.mag())?)
    } else {
        AhrsFilter::new()
    };

    let mut estimates = Vec::with_capacity(corrected.len());
    let mut previous = first.time;
    let mut rejected = 0usize;
    for raw in corrected.iter().skip(1) {
        let dt = raw.time.saturating_sub(previous).as_secs_f32();
        previous = raw.time;
        match ahrs.update(raw.accel(), raw.mag(), raw.gyro(), args.beta, dt) {
            Ok(q) => estimates.push(OrientationRecord::new(raw.time, &q)),
            Err(e) => {
                rejected += 1;
                warn!(time = raw.time.as_secs_f64(), "Skipping sample: {e}");
            }
        }
    }

    write_csv(&args.output, &estimates)
        .with_context(|| format!("Failed to write estimates to {}", args.output.display()))?;
    info!(
        written = estimates.len(),
        rejected,
        output = %args.output.display(),
        "AHRS run complete"
    );
    Ok(())
}

fn run_ekf_demo(args: EkfDemoArgs) -> Result<()> {
    let pendulum = Pendulum {
        gravity_over_length: 9.81,
        damping: 0.2,
    };
    let no_control = DVector::zeros(0);
    let noise = Normal::new(0.0, args.noise)?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut truth = DVector::from_vec(vec![0.8, 0.0]);
    let mut ekf = ExtendedKalmanFilter::with_options(
        DVector::from_vec(vec![0.6, 0.2]),
        pendulum,
        DMatrix::<f64>::identity(2, 2) * args.noise.powi(2),
        DMatrix::<f64>::identity(2, 2) * 1e-5,
        EkfOptions {
            propagation: args.propagation.into(),
            ..Default::default()
        },
    )?;

    let mut raw_sq = 0.0;
    let mut filtered_sq = 0.0;
    let mut rejected = 0usize;
    for step in 0..args.steps {
        let time = step as f64 * args.dt;
        truth = rk4_step(&pendulum, time, &truth, &no_control, args.dt);
        let z = truth.map(|v| v + noise.sample(&mut rng));

        ekf.predict(time + args.dt, &no_control, args.dt)?;
        if let Err(e) = ekf.update(&z) {
            rejected += 1;
            warn!(step, "Measurement rejected: {e}");
        }

        raw_sq += (&z - &truth).norm_squared();
        filtered_sq += (ekf.state() - &truth).norm_squared();
    }

    let n = args.steps.max(1) as f64;
    println!("measurement RMS error: {:.5}", (raw_sq / n).sqrt());
    println!("filtered RMS error:    {:.5}", (filtered_sq / n).sqrt());
    println!("rejected updates:      {rejected}");
    println!("final covariance trace: {:.3e}", ekf.covariance().trace());
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Ahrs(ahrs_args) => run_ahrs(ahrs_args),
        Command::EkfDemo(demo_args) => run_ekf_demo(demo_args),
    }
}
