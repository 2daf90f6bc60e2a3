use clap::{Parser, Subcommand};
use simhospital_core::loader::{load_all, ConfigPaths};
use simhospital_core::pathway::{split_names, PathwayFilter};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "simhospital-cli")]
#[command(about = "Offline checks for Simulated Hospital configuration")]
struct Cli {
    /// Directory holding the `configs/` tree
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every configuration file and cross-check references
    Validate,
    /// List pathways, marking those the filters admit
    List {
        /// Comma-separated names or regexes to include (empty means all)
        #[arg(long, default_value = "")]
        pathway_names: String,
        /// Comma-separated names or regexes to exclude
        #[arg(long, default_value = "")]
        exclude_pathway_names: String,
    },
    /// Render one pathway's steps
    Show {
        /// Pathway name
        name: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let paths = ConfigPaths::under(&cli.root);

    match cli.command {
        Some(Commands::Validate) => {
            let loaded = load_all(&paths)?;
            println!(
                "OK: {} pathways, {} hardcoded messages, {} locations, {} doctors, {} order profiles",
                loaded.catalog.len(),
                loaded.templates.len(),
                loaded.pools.locations.len(),
                loaded.pools.doctors.len(),
                loaded.pools.order_profiles.len()
            );
        }
        Some(Commands::List {
            pathway_names,
            exclude_pathway_names,
        }) => {
            let loaded = load_all(&paths)?;
            let filter = PathwayFilter::new(
                &split_names(&pathway_names),
                &split_names(&exclude_pathway_names),
            )?;
            for name in loaded.catalog.names() {
                let marker = if filter.allows(&name) { "*" } else { " " };
                println!("{marker} {name}");
            }
            let eligible = loaded.eligible_names(&filter).len();
            println!("{eligible} of {} pathways eligible", loaded.catalog.len());
        }
        Some(Commands::Show { name }) => {
            let loaded = load_all(&paths)?;
            let Some(pathway) = loaded.catalog.get(&name) else {
                return Err(format!("unknown pathway '{name}'").into());
            };
            println!(
                "{} ({} steps{})",
                pathway.name(),
                pathway.steps().len(),
                if pathway.is_looping() { ", looping" } else { "" }
            );
            for (index, step) in pathway.steps().iter().enumerate() {
                let delay = match &step.delay {
                    Some(d) if d.from == d.to => format!(" after {:?}", d.from),
                    Some(d) => format!(" after {:?}..{:?}", d.from, d.to),
                    None => String::new(),
                };
                let jump = step
                    .goto
                    .as_deref()
                    .map(|t| format!(" -> {t}"))
                    .unwrap_or_default();
                println!("  {index:>2}. {}{delay}{jump}", step.label());
            }
        }
        None => {
            println!("Use 'simhospital-cli --help' for commands");
        }
    }

    Ok(())
}
