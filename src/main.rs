use clap::Parser;
use openclaw::agents::{load_auth_store, resolved_agent_dirs};
use openclaw::cli::{Cli, Commands, ConfigAction, SecretsAction};
use openclaw::config::{validate_config_object, Config};
use openclaw::infra::secrets::sops::find_sops_config;
use openclaw::infra::secrets::{
    apply_migration_plan, build_migration_plan, prepare_snapshot, rollback_migration,
    ActivationTrigger, MigrationPlan, MigrationSettings, PrepareSnapshotParams, SECRETS_ACTIVATOR,
};
use openclaw::logging;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Secrets(opts) => match opts.action {
            SecretsAction::Reload { json } => {
                reload_secrets(opts.config.as_deref(), json).await?;
            }
            SecretsAction::Migrate {
                write,
                no_scrub_env,
                json,
                rollback,
            } => {
                let config = Config::load(opts.config.as_deref())?;
                let settings = MigrationSettings {
                    config_path: config.path.clone(),
                    state_dir: config.state_dir.clone(),
                    scrub_env: !no_scrub_env,
                };
                match rollback {
                    Some(backup_id) => {
                        let outcome = rollback_migration(&settings.state_dir, &backup_id)?;
                        if json {
                            println!("{}", serde_json::to_string_pretty(&outcome)?);
                        } else {
                            println!(
                                "Restored backup {}: {} file(s) restored, {} deleted",
                                outcome.backup_id,
                                outcome.restored_files.len(),
                                outcome.deleted_files.len()
                            );
                        }
                    }
                    None => {
                        migrate_secrets(&settings, write, json).await?;
                    }
                }
            }
        },
        Commands::Config(opts) => {
            let config = Config::load(opts.config.as_deref())?;
            match opts.action {
                ConfigAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&config.doc)?);
                }
                ConfigAction::Validate => {
                    validate_config_object(&config.doc)?;
                    info!("Configuration is valid");
                }
            }
        }
        Commands::Version => {
            println!("openclaw {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn reload_secrets(config_path: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let agent_dirs = resolved_agent_dirs(&config);
    let sops_config_path = find_sops_config(&config.config_dir());

    let built = prepare_snapshot(
        PrepareSnapshotParams {
            config: &config.doc,
            sops_config_path: sops_config_path.as_deref(),
            env: None,
            agent_dirs: &agent_dirs,
            missing_binary_message: None,
        },
        load_auth_store,
    )
    .await;

    let snapshot = SECRETS_ACTIVATOR.apply_build_result(built, ActivationTrigger::Reload)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "warningCount": snapshot.warnings.len(),
                "warnings": &snapshot.warnings,
            })
        );
    } else {
        println!(
            "Secrets reloaded: {} warning(s)",
            snapshot.warnings.len()
        );
        for warning in &snapshot.warnings {
            println!("  [{}] {}", warning.code, warning.message);
        }
    }
    Ok(())
}

async fn migrate_secrets(
    settings: &MigrationSettings,
    write: bool,
    json: bool,
) -> anyhow::Result<()> {
    let plan = build_migration_plan(settings).await?;

    if !write {
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "mode": "plan",
                    "changed": plan.changed,
                    "counters": &plan.counters,
                    "files": plan_targets(&plan),
                })
            );
        } else if plan.changed {
            println!("Dry run — rerun with --write to apply. Planned changes:");
            for target in plan_targets(&plan) {
                println!("  {target}");
            }
            print_counters(&plan);
        } else {
            println!("Nothing to migrate.");
        }
        return Ok(());
    }

    let outcome = apply_migration_plan(&plan, settings).await?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "mode": "write",
                "changed": outcome.changed,
                "backupId": &outcome.backup_id,
                "counters": &outcome.counters,
            })
        );
    } else if outcome.changed {
        println!(
            "Migration complete (backup {})",
            outcome.backup_id.as_deref().unwrap_or("-")
        );
        print_counters(&plan);
    } else {
        println!("Nothing to migrate.");
    }
    Ok(())
}

fn plan_targets(plan: &MigrationPlan) -> Vec<String> {
    plan.backup_targets
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

fn print_counters(plan: &MigrationPlan) {
    let c = &plan.counters;
    println!(
        "  {} config ref(s), {} auth profile ref(s), {} secret(s) written, \
         {} plaintext value(s) removed, {} env line(s) removed, {} auth store(s) changed",
        c.config_refs,
        c.auth_profile_refs,
        c.secrets_written,
        c.plaintext_removed,
        c.env_entries_removed,
        c.auth_stores_changed
    );
}
