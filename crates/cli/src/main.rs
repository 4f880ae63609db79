use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use vsync_core::{NamespacedName, Translator};
use vsync_patches::{apply_patches, prepare_regex, process_regex, Patch, PatchOutcome};
use vsync_syncer::generic::VirtualToHost;

#[derive(Parser, Debug)]
#[command(name = "vsyncctl", version, about = "Try vsync patch rules and name translation offline")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    /// Name of the virtual cluster, used as the host name suffix and marker
    #[arg(long = "vcluster-name", env = "VSYNC_VCLUSTER_NAME", global = true, default_value = "vcluster")]
    vcluster_name: String,

    /// Host namespace objects are synced into
    #[arg(long = "target-namespace", env = "VSYNC_TARGET_NAMESPACE", global = true, default_value = "vcluster")]
    target_namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply patch rules to an object and print the result
    Patch {
        /// Object to patch (YAML or JSON)
        #[arg(long = "object")]
        object: PathBuf,
        /// List of patch rules (YAML)
        #[arg(long = "patches")]
        patches: PathBuf,
        /// Object copyFromObject rules read from; defaults to the patched object
        #[arg(long = "source")]
        source: Option<PathBuf>,
        /// Rules whose paths are stripped from the result
        #[arg(long = "reverse-patches")]
        reverse_patches: Option<PathBuf>,
    },
    /// Translate every name a rewriteName regex matches in a string
    Regex {
        /// Pattern with $NAME and optionally $NAMESPACE placeholders
        #[arg(long = "pattern")]
        pattern: String,
        #[arg(long = "input")]
        input: String,
        /// Namespace for matches without a $NAMESPACE capture
        #[arg(long = "namespace", default_value = "default")]
        namespace: String,
    },
    /// Print the host name of a virtual object
    HostName {
        #[arg(long = "name")]
        name: String,
        /// Leave empty for cluster-scoped objects
        #[arg(long = "namespace", default_value = "")]
        namespace: String,
    },
}

fn init_tracing() {
    let env = std::env::var("VSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn read_patches(path: &Path) -> Result<Vec<Patch>> {
    let mut patches: Vec<Patch> = read_yaml(path)?;
    for patch in &mut patches {
        patch.prepare().with_context(|| format!("invalid rule for path {}", patch.path))?;
    }
    Ok(patches)
}

/// Applies `patches` to `object` the way the export syncer does on its way to
/// the host: names are translated into `translator`'s target namespace.
fn patch_object(
    translator: &Translator,
    mut object: serde_json::Value,
    source: Option<&serde_json::Value>,
    patches: &[Patch],
    reverse_patches: &[Patch],
) -> Result<(serde_json::Value, PatchOutcome)> {
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string();
    let source = source.cloned().unwrap_or_else(|| object.clone());
    let resolver = VirtualToHost::new(translator, namespace);
    let outcome = apply_patches(&mut object, Some(&source), patches, reverse_patches, Some(&resolver))?;
    for (virtual_, host) in resolver.into_translated() {
        debug!(virtual_ = %virtual_, host = %host, "translated name");
    }
    Ok((object, outcome))
}

fn translate_regex(translator: &Translator, pattern: &str, input: &str, namespace: &str) -> Result<String> {
    let re = prepare_regex(pattern).with_context(|| format!("compiling pattern {pattern}"))?;
    Ok(process_regex(&re, input, |name, captured| {
        let ns = if captured.is_empty() { namespace } else { captured };
        NamespacedName::new(translator.target_namespace.clone(), translator.host_name(name, ns))
    }))
}

fn host_name(translator: &Translator, name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        translator.host_name_cluster(name)
    } else {
        translator.host_name(name, namespace)
    }
}

fn print(output: Output, value: &serde_json::Value) -> Result<()> {
    match output {
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let translator = Translator::new(cli.vcluster_name.clone(), cli.target_namespace.clone());

    match cli.command {
        Commands::Patch { object, patches, source, reverse_patches } => {
            info!(object = %object.display(), patches = %patches.display(), "patch invoked");
            let obj: serde_json::Value = read_yaml(&object)?;
            let source: Option<serde_json::Value> = source.as_deref().map(read_yaml).transpose()?;
            let rules = read_patches(&patches)?;
            let reverse = reverse_patches.as_deref().map(read_patches).transpose()?.unwrap_or_default();
            let (patched, outcome) = patch_object(&translator, obj, source.as_ref(), &rules, &reverse)?;
            info!(outcome = ?outcome, rules = rules.len(), "patch done");
            print(cli.output, &patched)?;
        }
        Commands::Regex { pattern, input, namespace } => {
            println!("{}", translate_regex(&translator, &pattern, &input, &namespace)?);
        }
        Commands::HostName { name, namespace } => {
            println!("{}", host_name(&translator, &name, &namespace));
        }
    }
    Ok(())
}
