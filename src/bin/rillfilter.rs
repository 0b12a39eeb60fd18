use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rillfilter::{
    FilterConfig, FilterParams, FilterQueryBuilder, SchemaRegistry, WithContext,
};
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "rillfilter", version, about = "Compile and run JSON filters against Postgres")]
struct Cli {
    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// JSON file with the entity schema (array of entities)
    #[arg(long)]
    schema: PathBuf,

    /// Root entity to query
    #[arg(long)]
    entity: String,

    /// Relation expression limiting eager loading, e.g. "[movies.category, pets]"
    #[arg(long)]
    allow_eager: Option<String>,

    /// Log queries slower than this on the rillfilter::slow_query target
    #[arg(long, default_value_t = 500)]
    slow_query_ms: u64,

    /// Upper bound for the requested limit
    #[arg(long)]
    max_limit: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ParamsArg {
    /// Filter parameters as JSON
    #[arg(long, default_value = "{}", conflicts_with = "params_file")]
    params: String,

    /// Read filter parameters from a JSON file
    #[arg(long)]
    params_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the root and count SQL without running anything
    Plan(ParamsArg),

    /// Run the query and print the documents as JSON
    Run(ParamsArg),

    /// Print the number of matching rows, ignoring limit and offset
    Count(ParamsArg),
}

impl ParamsArg {
    fn load(&self) -> rillfilter::Result<FilterParams> {
        let raw = match &self.params_file {
            Some(path) => std::fs::read_to_string(path)
                .map_err(rillfilter::Error::from)
                .context(format!("reading {}", path.display()))?,
            None => self.params.clone(),
        };
        serde_json::from_str(&raw)
            .map_err(rillfilter::Error::from)
            .context("parsing filter parameters")
    }
}

#[tokio::main]
async fn main() -> rillfilter::Result<()> {
    let cli = Cli::parse();

    let schema = std::fs::read_to_string(&cli.schema)
        .map_err(rillfilter::Error::from)
        .context(format!("reading {}", cli.schema.display()))?;
    let mut schema = SchemaRegistry::from_json(&schema)?;

    let params = match &cli.command {
        Commands::Plan(arg) | Commands::Run(arg) | Commands::Count(arg) => arg.load()?,
    };

    let pool = match &cli.command {
        Commands::Plan(_) => None,
        Commands::Run(_) | Commands::Count(_) => {
            let url = match cli
                .database_url
                .clone()
                .or_else(|| std::env::var("DATABASE_URL").ok())
            {
                Some(u) => u,
                None => {
                    eprintln!("error: --database-url or env DATABASE_URL is required");
                    std::process::exit(2);
                }
            };
            let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;
            schema
                .load_column_types(&pool)
                .await
                .context("loading column types")?;
            Some(pool)
        }
    };

    let mut builder =
        FilterQueryBuilder::new(Arc::new(schema), &cli.entity)?.with_config(FilterConfig {
            slow_query_threshold: Duration::from_millis(cli.slow_query_ms),
            max_limit: cli.max_limit,
        });
    if let Some(expression) = &cli.allow_eager {
        builder = builder.allow_eager(expression)?;
    }

    let query = builder.build(&params)?;
    debug!(entity = %cli.entity, "filter compiled");

    match (&cli.command, pool) {
        (Commands::Run(_), Some(pool)) => {
            let docs = query.fetch_all(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        (Commands::Count(_), Some(pool)) => println!("{}", builder.count(&pool).await?),
        _ => {
            println!("{}", query.sql());
            println!("{}", builder.count_sql()?);
            for (path, scope) in query.plan().modifiers() {
                println!(
                    "-- {path}: {} predicate(s), {} joined filter(s)",
                    scope.predicates.len(),
                    scope.joined.len()
                );
            }
        }
    }

    Ok(())
}
