use std::error::Error;

use clap::{Parser, Subcommand};
use cube_network::{
    protocol::{
        ClientConnection,
        requests::{
            CallpathTreeValuesRequest, MetricSubtreeValuesRequest, MetricTreeValuesRequest,
            OpenReportRequest, SystemTreeValuesRequest, VersionRequest, library_version,
        },
    },
    report::{CalculationFlavour, Selection, TreeNode, Value},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the report server
    address: String,
    /// Report file, relative to the server's report directory
    report: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print client and server versions
    Version,
    /// Print the trees of the report
    Summary,
    /// Metric values over selected call paths and system resources
    MetricTree {
        /// Call-tree node as ID:incl or ID:excl; repeatable
        #[arg(long = "cnode", value_parser = parse_selection)]
        cnodes: Vec<Selection>,
        /// System resource as ID:incl or ID:excl; repeatable
        #[arg(long = "sysres", value_parser = parse_selection)]
        sysres: Vec<Selection>,
    },
    /// System resource values over selected metrics and call paths
    SystemTree {
        /// Metric as ID:incl or ID:excl; repeatable
        #[arg(long = "metric", value_parser = parse_selection)]
        metrics: Vec<Selection>,
        /// Call-tree node as ID:incl or ID:excl; repeatable
        #[arg(long = "cnode", value_parser = parse_selection)]
        cnodes: Vec<Selection>,
    },
    /// Call-tree node values over selected metrics and system resources
    CallpathTree {
        /// Metric as ID:incl or ID:excl; repeatable
        #[arg(long = "metric", value_parser = parse_selection)]
        metrics: Vec<Selection>,
        /// System resource as ID:incl or ID:excl; repeatable
        #[arg(long = "sysres", value_parser = parse_selection)]
        sysres: Vec<Selection>,
    },
    /// Values of the metrics below one metric
    MetricSubtree {
        /// Id of the subtree's root metric
        root: u32,
        /// Levels below the root to include
        #[arg(short, long, default_value_t = u64::MAX)]
        depth: u64,
        /// Call-tree node as ID:incl or ID:excl; repeatable
        #[arg(long = "cnode", value_parser = parse_selection)]
        cnodes: Vec<Selection>,
        /// System resource as ID:incl or ID:excl; repeatable
        #[arg(long = "sysres", value_parser = parse_selection)]
        sysres: Vec<Selection>,
    },
}

fn parse_selection(s: &str) -> Result<Selection, String> {
    let (id, flavour) = s.split_once(':').unwrap_or((s, "incl"));
    let id = id
        .parse::<u32>()
        .map_err(|e| format!("invalid node id '{id}': {e}"))?;
    let flavour = match flavour {
        "incl" | "inclusive" => CalculationFlavour::Inclusive,
        "excl" | "exclusive" => CalculationFlavour::Exclusive,
        other => return Err(format!("unknown flavour '{other}', expected incl or excl")),
    };
    Ok((id, flavour))
}

fn print_tree(title: &str, nodes: &[TreeNode]) {
    println!("{title}:");
    for node in nodes {
        let depth = ancestors(nodes, node);
        println!("  {:indent$}[{}] {}", "", node.id, node.name, indent = depth * 2);
    }
}

fn ancestors(nodes: &[TreeNode], node: &TreeNode) -> usize {
    let mut depth = 0;
    let mut parent = node.parent;
    while let Some(id) = parent {
        if depth >= nodes.len() {
            break;
        }
        depth += 1;
        parent = nodes.get(id as usize).and_then(|node| node.parent);
    }
    depth
}

fn print_values(nodes: &[TreeNode], inclusive: &[Value], exclusive: &[Value]) {
    println!("{:<6} {:<24} {:>16} {:>16}", "id", "name", "inclusive", "exclusive");
    for ((node, incl), excl) in nodes.iter().zip(inclusive).zip(exclusive) {
        println!(
            "{:<6} {:<24} {:>16} {:>16}",
            node.id,
            node.name,
            incl.to_string(),
            excl.to_string()
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = ClientConnection::connect(cli.address.as_str())?;

    if let Command::Version = cli.command {
        let version = client.execute(VersionRequest::new())?;
        println!("client library {}", library_version());
        println!(
            "server library {}, protocol {}",
            version.library_version(),
            version.protocol_version()
        );
        if !version.is_compatible() {
            eprintln!("warning: server speaks a different protocol version");
        }
        client.shutdown()?;
        return Ok(());
    }

    let opened = client.execute(OpenReportRequest::new(&cli.report))?;
    let summary = opened
        .summary()
        .cloned()
        .ok_or("server sent no report summary")?;

    match cli.command {
        Command::Version => {}
        Command::Summary => {
            println!("report '{}'", summary.name);
            print_tree("metrics", &summary.metrics);
            print_tree("call tree", &summary.cnodes);
            print_tree("system tree", &summary.sysres);
        }
        Command::MetricTree { cnodes, sysres } => {
            let (inclusive, exclusive) = client
                .execute(MetricTreeValuesRequest::new(cnodes, sysres))?
                .into_values();
            print_values(&summary.metrics, &inclusive, &exclusive);
        }
        Command::SystemTree { metrics, cnodes } => {
            let (inclusive, exclusive) = client
                .execute(SystemTreeValuesRequest::new(metrics, cnodes))?
                .into_values();
            print_values(&summary.sysres, &inclusive, &exclusive);
        }
        Command::CallpathTree { metrics, sysres } => {
            let (inclusive, exclusive) = client
                .execute(CallpathTreeValuesRequest::new(metrics, sysres))?
                .into_values();
            print_values(&summary.cnodes, &inclusive, &exclusive);
        }
        Command::MetricSubtree {
            root,
            depth,
            cnodes,
            sysres,
        } => {
            let values = client
                .execute(MetricSubtreeValuesRequest::new(cnodes, sysres, root, depth))?
                .into_values();
            let nodes = values
                .ids
                .iter()
                .filter_map(|&id| summary.metrics.get(id as usize).cloned())
                .collect::<Vec<_>>();
            print_values(&nodes, &values.inclusive, &values.exclusive);
        }
    }

    client.shutdown()?;
    Ok(())
}
