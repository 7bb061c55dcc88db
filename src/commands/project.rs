// ABOUTME: Project command - remembers which hosted project the CLI talks to
// ABOUTME: Shows the REST and realtime endpoints derived from the saved URL

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use url::Url;

use crate::state::{self, AppState};
use crate::supabase::protocol::socket_url;
use crate::utils::validate_project_url;

#[derive(Args)]
pub struct ProjectArgs {
    #[command(subcommand)]
    action: ProjectAction,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Save the project URL used when neither --url nor the config file sets one
    Set {
        /// Base URL of the project, e.g. https://<project>.supabase.co
        url: String,
    },
    /// Forget the saved project URL
    Unset,
    /// Print the saved project URL and the endpoints derived from it
    Get,
}

pub async fn command(args: ProjectArgs) -> Result<()> {
    let mut saved = state::load().context("Failed to load state")?;
    match args.action {
        ProjectAction::Set { url } => {
            let url = validate_project_url(&url)?;
            remember(&mut saved, &url)?;
        }
        ProjectAction::Unset => forget(&mut saved)?,
        ProjectAction::Get => describe(&saved)?,
    }
    Ok(())
}

fn remember(saved: &mut AppState, url: &Url) -> Result<()> {
    let base = url.as_str().trim_end_matches('/').to_string();
    if let Some(previous) = saved.project_url.replace(base.clone()) {
        if previous != base {
            tracing::info!("Replacing saved project URL {}", previous);
        }
    }
    state::save(saved).context("Failed to save state")?;
    println!("Project URL set to: {}", base);
    Ok(())
}

fn forget(saved: &mut AppState) -> Result<()> {
    match saved.project_url.take() {
        Some(previous) => {
            state::save(saved).context("Failed to save state")?;
            tracing::debug!("Removed saved project URL {}", previous);
        }
        None => tracing::debug!("No saved project URL to remove"),
    }
    println!("Project URL unset.");
    Ok(())
}

fn describe(saved: &AppState) -> Result<()> {
    let Some(base) = saved.project_url.as_deref() else {
        println!("Project URL is not set.");
        return Ok(());
    };
    println!("Current project URL: {}", base);

    // A hand-edited state file can hold anything.
    let url = match validate_project_url(base) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("Saved project URL is not usable: {}", e);
            return Ok(());
        }
    };
    let (rest, realtime) = endpoints(&url)?;
    println!("  REST:     {}", rest);
    println!("  Realtime: {}", realtime);
    Ok(())
}

/// REST base and websocket endpoint of a project, without credentials.
fn endpoints(project: &Url) -> Result<(String, Url)> {
    let rest = format!("{}/rest/v1", project.as_str().trim_end_matches('/'));
    let mut realtime = socket_url(project, "")?;
    realtime.set_query(None);
    Ok((rest, realtime))
}
