use clap::Parser;
use futures::StreamExt;
use kube::ResourceExt;
use kube::core::{DynamicObject, WatchEvent};
use anyhow::Context;
use kubestream::k8s::config::{BasicAuth, ConnectionConfig, ConnectionOptions};
use kubestream::k8s::watch::config::DEFAULT_WATCH_TIMEOUT_MS;
use kubestream::k8s::watch::{Notice, ResyncConfig, ResyncStream};
use kubestream::ApiClient;
use std::path::{Path, PathBuf};
use tokio_stream::wrappers::BroadcastStream;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Plural name of the resource to watch
    #[arg(default_value = "pods")]
    resource: String,

    /// API version of the resource, `v1` for the core group
    #[arg(long, default_value = "v1")]
    api_version: String,

    /// Namespace to watch, defaults to the kubeconfig namespace
    #[arg(short, long, conflicts_with = "all_namespaces")]
    namespace: Option<String>,

    /// Watch every namespace (or a cluster scoped resource)
    #[arg(short = 'A', long)]
    all_namespaces: bool,

    /// Label selector, e.g. `app=web`
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Base server side watch timeout
    #[arg(long, default_value_t = DEFAULT_WATCH_TIMEOUT_MS)]
    timeout_ms: u64,

    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    #[arg(long)]
    context: Option<String>,

    /// Use the pod's service account instead of a kubeconfig
    #[arg(long, conflicts_with_all = ["kubeconfig", "context"])]
    in_cluster: bool,

    /// API server url, overrides the kubeconfig cluster
    #[arg(long)]
    server: Option<String>,

    /// Bearer token
    #[arg(long)]
    token: Option<String>,

    #[arg(long, requires = "password", conflicts_with = "token")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// PEM file of certificate authorities to trust
    #[arg(long)]
    certificate_authority: Option<PathBuf>,

    /// PEM client certificate file
    #[arg(long, requires = "client_key")]
    client_certificate: Option<PathBuf>,

    /// PEM client key file
    #[arg(long, requires = "client_certificate")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification
    #[arg(long)]
    insecure_skip_tls_verify: bool,
}

fn read_pem(path: Option<&Path>) -> anyhow::Result<Option<Vec<u8>>> {
    path.map(|path| std::fs::read(path).with_context(|| format!("reading {}", path.display())))
        .transpose()
}

fn connection_options(args: &Args) -> anyhow::Result<ConnectionOptions> {
    let basic = match (&args.username, &args.password) {
        (Some(username), Some(password)) => Some(BasicAuth {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };

    Ok(ConnectionOptions {
        kubeconfig: args.kubeconfig.clone(),
        context: args.context.clone(),
        in_cluster: args.in_cluster,
        url: args.server.clone(),
        namespace: args.namespace.clone(),
        token: args.token.clone(),
        basic,
        insecure_skip_tls_verify: args.insecure_skip_tls_verify,
        ca: read_pem(args.certificate_authority.as_deref())?,
        cert: read_pem(args.client_certificate.as_deref())?,
        key: read_pem(args.client_key.as_deref())?,
    })
}

fn object_summary(obj: &DynamicObject) -> String {
    let name = match obj.namespace() {
        Some(namespace) => format!("{namespace}/{}", obj.name_any()),
        None => obj.name_any(),
    };
    format!("{name} rv {}", obj.resource_version().unwrap_or_default())
}

fn describe(event: &WatchEvent<DynamicObject>) -> String {
    match event {
        WatchEvent::Added(obj) => format!("ADDED    {}", object_summary(obj)),
        WatchEvent::Modified(obj) => format!("MODIFIED {}", object_summary(obj)),
        WatchEvent::Deleted(obj) => format!("DELETED  {}", object_summary(obj)),
        WatchEvent::Bookmark(bookmark) => {
            format!("BOOKMARK rv {}", bookmark.metadata.resource_version)
        }
        WatchEvent::Error(status) => format!("ERROR    {} {}", status.code, status.message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let options = connection_options(&args)?;
    let config = ConnectionConfig::resolve(&options).await?;

    let mut api = ApiClient::try_from_config(&config)?;
    if args.all_namespaces {
        api = api.all_namespaces();
    } else if let Some(namespace) = args.namespace {
        api = api.namespaced(namespace);
    }

    let mut lister = api.list_watcher::<DynamicObject>(&args.api_version, &args.resource);
    if let Some(selector) = &args.selector {
        lister = lister.label_selector(selector);
    }
    info!("watching {}", lister.path());

    let resync = ResyncConfig::default().timeout(Duration::from_millis(args.timeout_ms));
    let mut stream = ResyncStream::with_config(lister, resync);
    let mut notices = BroadcastStream::new(stream.subscribe());

    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                stream.close();
                break;
            }
            Some(notice) = notices.next() => {
                if let Ok(Notice::Listed(list)) = notice {
                    println!(
                        "LISTED   {} {} at rv {}",
                        list.items.len(),
                        list.types.kind,
                        list.metadata.resource_version.unwrap_or_default()
                    );
                }
            }
            item = stream.next() => match item {
                Some(Ok(event)) => println!("{}", describe(&event)),
                Some(Err(err)) => warn!("{err}"),
                None => break,
            },
        }
    }

    Ok(())
}
