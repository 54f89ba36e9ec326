use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ocidist::auth::{AuthProvider, BearerEngine};
use ocidist::client::Registry;
use ocidist::content_store::{ContentStore, Selector};
use ocidist::copy::{self, CopyOptions};
use ocidist::credentials::{Credential, CredentialStore};
use ocidist::oci_layout::OciLayout;
use ocidist::packager::{self, Input};
use ocidist::reference::ContainerRef;
use ocidist::registries_conf::RegistriesConf;

#[derive(Parser, Debug)]
#[command(version, about = "OCI Distribution client", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the tags of a repository.
    ListTags { reference: String },
    /// List the repositories a registry hosts.
    ListRepos { registry: String },
    /// Pull a manifest and print it as JSON.
    PullManifest { reference: String },
    /// Push a single file as a blob, chunked in pieces of `chunk_size`.
    PushBlobChunked {
        reference: String,
        path: PathBuf,
        #[arg(long, default_value_t = 8 * 1024 * 1024)]
        chunk_size: usize,
    },
    /// Delete a blob by digest (`host/name@sha256:...`).
    DeleteBlob { reference: String },
    /// Delete a manifest by tag or digest.
    DeleteManifest { reference: String },
    /// Push files/directories as an OCI artifact.
    PushArtifact {
        reference: String,
        #[arg(long)]
        artifact_type: Option<String>,
        paths: Vec<PathBuf>,
    },
    /// Pull an OCI artifact's layers into a directory.
    PullArtifact {
        reference: String,
        dest: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
    /// Copy a manifest (and, with --recursive, its referrers) between
    /// two references. Either side may be a registry reference
    /// (`host/name:tag`) or an OCI Image Layout path prefixed `oci:`.
    Copy {
        source: String,
        dest: String,
        #[arg(long)]
        recursive: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args.command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::vars().find_map(|(k, v)| if k == name { Some(v) } else { None })
}

fn load_registries_conf() -> ocidist::error::Result<RegistriesConf> {
    Ok(RegistriesConf::load_default(env_var("HOME").as_deref())?)
}

/// Builds the auth provider from the Docker-style credential store
/// (`$DOCKER_CONFIG`/`$HOME/.docker/config.json`), overlaid with
/// `OCI_USERNAME`/`OCI_PASSWORD` for `host` if both are set.
fn build_auth(host: &str) -> ocidist::error::Result<AuthProvider> {
    let mut store = CredentialStore::load_default(env_var("HOME").as_deref(), env_var("DOCKER_CONFIG").as_deref())?;
    if let (Some(username), Some(password)) = (env_var("OCI_USERNAME"), env_var("OCI_PASSWORD")) {
        store.put(host.to_string(), Credential::new(username, password)?);
    }
    Ok(AuthProvider::Bearer(BearerEngine::new(store)))
}

/// Connects to `host` for host-scoped operations that have no
/// repository of their own (`/v2/_catalog`).
async fn connect_host(host: &str) -> ocidist::error::Result<Registry> {
    let conf = load_registries_conf()?;
    let insecure = conf.is_insecure(host);
    let auth = build_auth(host)?;
    Registry::for_host(host, "", auth, insecure)
}

async fn connect(reference: &str) -> ocidist::error::Result<(Registry, ContainerRef)> {
    let parsed: ContainerRef = reference
        .parse()
        .map_err(|e: ocidist::reference::Error| ocidist::error::Error::Parse(e.to_string()))?;
    let conf = load_registries_conf()?;
    let auth = build_auth(parsed.api_registry())?;
    let registry = Registry::connect(&parsed, &conf, auth).await?;
    Ok((registry, parsed))
}

fn selector_for(reference: &ContainerRef) -> ocidist::error::Result<Selector> {
    if let Some(digest) = reference.digest() {
        Ok(Selector::from_digest(digest.clone()))
    } else if let Some(tag) = reference.tag() {
        Ok(Selector::from_tag(tag))
    } else {
        Err(ocidist::error::Error::invariant("reference has neither tag nor digest"))
    }
}

/// A `Copy` endpoint: either a registry reference or `oci:<dir>[:tag]`.
enum Endpoint {
    Registry(Registry, Selector),
    Layout(OciLayout, Selector),
}

async fn resolve_endpoint(spec: &str) -> ocidist::error::Result<Endpoint> {
    if let Some(rest) = spec.strip_prefix("oci:") {
        let (dir, tag) = match rest.split_once(':') {
            Some((dir, tag)) => (dir, Some(tag)),
            None => (rest, None),
        };
        let layout = OciLayout::open(dir).or_else(|_| OciLayout::create(dir))?;
        let selector = match tag {
            Some(tag) => Selector::from_tag(tag),
            None => Selector::from_tag("latest"),
        };
        return Ok(Endpoint::Layout(layout, selector));
    }
    let (registry, reference) = connect(spec).await?;
    let selector = selector_for(&reference)?;
    Ok(Endpoint::Registry(registry, selector))
}

async fn run(cmd: Cmd) -> ocidist::error::Result<()> {
    match cmd {
        Cmd::ListTags { reference } => {
            let (registry, _) = connect(&reference).await?;
            for tag in registry.list_tags().await? {
                println!("{tag}");
            }
        }
        Cmd::ListRepos { registry } => {
            let registry = connect_host(&registry).await?;
            for repo in registry.list_repos().await? {
                println!("{repo}");
            }
        }
        Cmd::PushBlobChunked { reference, path, chunk_size } => {
            let (registry, _) = connect(&reference).await?;
            let data = bytes::Bytes::from(std::fs::read(&path)?);
            let digest = ocidist::digest::digest(&data);
            registry.push_blob_chunked(&digest, data, chunk_size).await?;
            println!("pushed {digest}");
        }
        Cmd::DeleteBlob { reference } => {
            let (registry, parsed) = connect(&reference).await?;
            let digest = parsed
                .digest()
                .ok_or_else(|| ocidist::error::Error::invariant("reference has no digest"))?;
            registry.delete_blob(digest).await?;
            println!("deleted {digest}");
        }
        Cmd::DeleteManifest { reference } => {
            let (registry, parsed) = connect(&reference).await?;
            let selector = selector_for(&parsed)?;
            registry.delete_manifest(&selector).await?;
            println!("deleted manifest");
        }
        Cmd::PullManifest { reference } => {
            let (registry, parsed) = connect(&reference).await?;
            let selector = selector_for(&parsed)?;
            let (descriptor, body) = registry
                .get_manifest(&selector)
                .await?
                .ok_or_else(|| ocidist::error::Error::invariant("manifest not found"))?;
            println!("digest: {}", descriptor.digest());
            println!("{}", String::from_utf8_lossy(&body));
        }
        Cmd::PushArtifact {
            reference,
            artifact_type,
            paths,
        } => {
            let (registry, parsed) = connect(&reference).await?;
            let selector = selector_for(&parsed)?;
            let inputs: Vec<Input> = paths.into_iter().map(Input::new).collect();
            let descriptor = packager::push_artifact(
                &registry,
                &selector,
                artifact_type.as_deref(),
                Default::default(),
                &inputs,
            )
            .await?;
            println!("pushed {}", descriptor.digest());
        }
        Cmd::PullArtifact {
            reference,
            dest,
            overwrite,
        } => {
            let (registry, parsed) = connect(&reference).await?;
            let selector = selector_for(&parsed)?;
            packager::pull_artifact(&registry, &selector, &dest, overwrite).await?;
            println!("pulled into {}", dest.display());
        }
        Cmd::Copy {
            source,
            dest,
            recursive,
        } => {
            let source = resolve_endpoint(&source).await?;
            let dest = resolve_endpoint(&dest).await?;
            let options = CopyOptions { recursive };
            let descriptor = match (source, dest) {
                (Endpoint::Registry(src, src_sel), Endpoint::Registry(dst, dst_sel)) => {
                    copy::copy_registry_to_registry(&src, &dst, &src_sel, &dst_sel, &options).await?
                }
                (Endpoint::Registry(src, src_sel), Endpoint::Layout(dst, dst_sel)) => {
                    copy::copy(&src, &dst, &src_sel, &dst_sel, &options).await?
                }
                (Endpoint::Layout(src, src_sel), Endpoint::Registry(dst, dst_sel)) => {
                    copy::copy(&src, &dst, &src_sel, &dst_sel, &options).await?
                }
                (Endpoint::Layout(src, src_sel), Endpoint::Layout(dst, dst_sel)) => {
                    copy::copy(&src, &dst, &src_sel, &dst_sel, &options).await?
                }
            };
            println!("copied {}", descriptor.digest());
        }
    }
    Ok(())
}
