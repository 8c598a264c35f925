use clap::Args;
use serde::Serialize;

use metadb_graph::{ArcReport, ExtendedCallGraph};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Record files or glob patterns
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct FileReport {
    file: String,
    artifact: Option<String>,
    methods: usize,
    arcs: Option<ArcReport>,
    error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct ValidationSummary {
    valid: usize,
    invalid: usize,
    arcs: ArcReport,
    files: Vec<FileReport>,
}

/// Parse and validate every record; storage is never opened.
pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let files = super::expand_inputs(&args.inputs)?;

    let mut summary = ValidationSummary::default();
    for path in &files {
        let file = path.display().to_string();
        let checked = std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|text| Ok(ExtendedCallGraph::from_json(&text)?))
            .and_then(|graph| Ok(metadb_graph::validate(&graph)?));

        let report = match checked {
            Ok(validated) => {
                summary.valid += 1;
                summary.arcs.merge(&validated.report);
                FileReport {
                    file,
                    artifact: Some(validated.artifact()),
                    methods: validated.method_count(),
                    arcs: Some(validated.report),
                    error: None,
                }
            }
            Err(e) => {
                summary.invalid += 1;
                FileReport {
                    file,
                    artifact: None,
                    methods: 0,
                    arcs: None,
                    error: Some(format!("{e:#}")),
                }
            }
        };
        summary.files.push(report);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if summary.invalid > 0 {
        anyhow::bail!(
            "{} of {} records failed validation",
            summary.invalid,
            summary.valid + summary.invalid
        );
    }
    Ok(())
}

fn print_summary(summary: &ValidationSummary) {
    for report in &summary.files {
        match (&report.artifact, &report.arcs, &report.error) {
            (Some(artifact), Some(arcs), _) => println!(
                "{}: {artifact} ({} methods, {} arcs accepted, {} rejected)",
                report.file,
                report.methods,
                arcs.accepted,
                arcs.rejected_count()
            ),
            (_, _, Some(error)) => println!("{}: invalid: {error}", report.file),
            _ => {}
        }
    }
    println!();
    println!(
        "{} valid, {} invalid; arcs: {} accepted, {} rejected",
        summary.valid,
        summary.invalid,
        summary.arcs.accepted,
        summary.arcs.rejected_count()
    );
    for (reason, count) in &summary.arcs.rejected {
        println!("  {:<22} {count:>6}", reason.as_str());
    }
}
