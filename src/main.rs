use clap::{Args, Parser, Subcommand, ValueEnum};
use glmproj::data::{FitData, load_fit_data};
use glmproj::model::FitSpec;
use glmproj::{ElnetFit, GlmFamily, LinkFunction, RidgeFit, glm_elnet, glm_ridge};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "glmproj",
    version,
    about = "Fit penalized generalized linear models (elastic net and ridge) by IRLS",
    long_about = "Reads a delimited data file with a header row, treats one column as the \
                 response and the rest as predictors, and fits either an elastic-net path \
                 or a single ridge model. Results are written as TOML."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit an elastic-net path over one or more penalty strengths
    #[command(about = "Fit an elastic-net path (outputs: fit.toml)")]
    Elnet {
        #[command(flatten)]
        common: CommonArgs,

        /// Penalty strengths, comma separated, solved in the given order
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        lambda: Option<Vec<f64>>,

        /// Mixing parameter: 0 is ridge, 1 is lasso
        #[arg(long)]
        alpha: Option<f64>,

        /// Maximum number of non-zero coefficients
        #[arg(long)]
        pmax: Option<usize>,

        /// Never let the active set grow past pmax
        #[arg(long)]
        pmax_strict: bool,
    },

    /// Fit a ridge model for a single penalty strength
    #[command(about = "Fit a ridge model (outputs: fit.toml)")]
    Ridge {
        #[command(flatten)]
        common: CommonArgs,

        /// Penalty strength
        #[arg(long)]
        lambda: Option<f64>,

        /// Maximum number of step halvings per iteration
        #[arg(long)]
        ls_iter_max: Option<usize>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Path to the CSV (or .tsv) data file
    data: PathBuf,

    /// Response distribution; sets the link function
    #[arg(long, value_enum)]
    family: Option<FamilyArg>,

    /// TOML file with fit settings; flags given on the command line win
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name of the response column
    #[arg(long)]
    response: Option<String>,

    /// Name of a prior-weight column
    #[arg(long)]
    weights: Option<String>,

    /// Fit without an intercept
    #[arg(long)]
    no_intercept: bool,

    /// Convergence threshold on the largest coefficient change
    #[arg(long)]
    thresh: Option<f64>,

    /// Maximum number of IRLS iterations
    #[arg(long)]
    qa_updates_max: Option<usize>,

    /// Where to write the fitted model
    #[arg(long, default_value = "fit.toml")]
    out: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum FamilyArg {
    Gaussian,
    Binomial,
    Poisson,
}

impl From<FamilyArg> for LinkFunction {
    fn from(family: FamilyArg) -> Self {
        match family {
            FamilyArg::Gaussian => LinkFunction::Identity,
            FamilyArg::Binomial => LinkFunction::Logit,
            FamilyArg::Poisson => LinkFunction::Log,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Elnet {
            common,
            lambda,
            alpha,
            pmax,
            pmax_strict,
        } => elnet_command(&common, lambda, alpha, pmax, pmax_strict),
        Commands::Ridge {
            common,
            lambda,
            ls_iter_max,
        } => ridge_command(&common, lambda, ls_iter_max),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Reads the settings file (if any) and applies the shared flags on top of it.
fn resolve_spec(common: &CommonArgs) -> Result<FitSpec, Box<dyn std::error::Error>> {
    let mut spec = match &common.config {
        Some(path) => FitSpec::load(path)?,
        None => FitSpec::default(),
    };
    if let Some(family) = common.family {
        spec.link = family.into();
    }
    if let Some(response) = &common.response {
        spec.response = response.clone();
    }
    if let Some(weights) = &common.weights {
        spec.weights_column = Some(weights.clone());
    }
    if common.no_intercept {
        spec.elnet.intercept = false;
        spec.ridge.intercept = false;
    }
    if let Some(thresh) = common.thresh {
        spec.elnet.thresh = thresh;
        spec.ridge.thresh = thresh;
    }
    if let Some(cap) = common.qa_updates_max {
        spec.elnet.qa_updates_max = cap;
        spec.ridge.qa_updates_max = cap;
    }
    Ok(spec)
}

fn load_problem(
    common: &CommonArgs,
    spec: &FitSpec,
) -> Result<(FitData, GlmFamily), Box<dyn std::error::Error>> {
    println!("Loading data from: {}", common.data.display());
    let data = load_fit_data(
        &common.data,
        &spec.response,
        spec.weights_column.as_deref(),
    )?;
    let family = GlmFamily::new(spec.link, data.y.clone(), data.prior_weights.clone())?;
    println!(
        "Loaded {} observations with {} predictors ({:?} link)",
        family.nobs(),
        data.x.ncols(),
        family.link()
    );
    Ok((data, family))
}

fn elnet_command(
    common: &CommonArgs,
    lambda: Option<Vec<f64>>,
    alpha: Option<f64>,
    pmax: Option<usize>,
    pmax_strict: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut spec = resolve_spec(common)?;
    if let Some(lambda) = lambda {
        spec.elnet.lambda = lambda;
    }
    if let Some(alpha) = alpha {
        spec.elnet.alpha = alpha;
    }
    if pmax.is_some() {
        spec.elnet.pmax = pmax;
    }
    if pmax_strict {
        spec.elnet.pmax_strict = true;
    }

    let (data, mut family) = load_problem(common, &spec)?;
    let fit = glm_elnet(data.x.view(), &mut family, &spec.elnet)?;
    print_elnet_summary(&fit, &data.predictor_names);
    save(&common.out, |path| fit.save(path))
}

fn ridge_command(
    common: &CommonArgs,
    lambda: Option<f64>,
    ls_iter_max: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut spec = resolve_spec(common)?;
    if let Some(lambda) = lambda {
        spec.ridge.lambda = lambda;
    }
    if let Some(cap) = ls_iter_max {
        spec.ridge.ls_iter_max = cap;
    }

    let (data, mut family) = load_problem(common, &spec)?;
    let fit = glm_ridge(data.x.view(), &mut family, &spec.ridge)?;
    print_ridge_summary(&fit, &data.predictor_names);
    save(&common.out, |path| fit.save(path))
}

fn save<E>(path: &Path, write: impl FnOnce(&Path) -> Result<(), E>) -> Result<(), Box<dyn std::error::Error>>
where
    E: std::error::Error + 'static,
{
    write(path)?;
    println!("Fit saved to: {}", path.display());
    Ok(())
}

fn print_elnet_summary(fit: &ElnetFit, names: &[String]) {
    println!("\n{:>12}  {:>8}  {:>10}  {:>12}", "lambda", "nonzero", "iterations", "status");
    for (k, lambda) in fit.lambda.iter().enumerate() {
        let nonzero = fit.beta.column(k).iter().filter(|b| **b != 0.0).count();
        println!(
            "{:>12.4e}  {:>8}  {:>10}  {:>12?}",
            lambda, nonzero, fit.qa_updates[k], fit.status[k]
        );
    }
    if fit.truncated {
        println!("Path stopped early: pmax reached.");
    }

    if let Some(last) = fit.lambda.len().checked_sub(1) {
        println!("\nCoefficients at lambda = {:.4e}:", fit.lambda[last]);
        if fit.intercept {
            println!("  {:<20} {:>14.6}", "(intercept)", fit.beta0[last]);
        }
        for (name, value) in names.iter().zip(fit.beta.column(last).iter()) {
            println!("  {name:<20} {value:>14.6}");
        }
    }
}

fn print_ridge_summary(fit: &RidgeFit, names: &[String]) {
    println!(
        "\nRidge fit at lambda = {:.4e}: {:?} after {} iterations ({} step halvings)",
        fit.lambda, fit.status, fit.qa_updates, fit.ls_iterations
    );
    if let Some(objective) = fit.objective {
        println!("Penalized objective: {objective:.6e}");
    }
    if fit.intercept {
        println!("  {:<20} {:>14.6}", "(intercept)", fit.beta0);
    }
    for (name, value) in names.iter().zip(fit.beta.iter()) {
        println!("  {name:<20} {value:>14.6}");
    }
}
