use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::UserId;
use storage::{Storage, StoredAccount};

/// Offline maintenance for the bridge database. Run it while the bridge is stopped.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/bridge.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every known account and whether it is linked.
    Accounts,
    /// List cached remote identities.
    Identities,
    /// Forget the linked device of an account and drop its double puppet.
    Logout {
        #[arg(long)]
        user: String,
    },
    /// Drop the device keys of an account so it has to relink.
    PurgeKeys {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Accounts => {
            for account in storage.list_accounts().await? {
                println!(
                    "{}\tlinked={}\tremote_id={}\tnumber={}",
                    account.user_id,
                    account.is_logged_in(),
                    account.remote_id.map(|id| id.0).unwrap_or_default(),
                    account.remote_number.unwrap_or_default(),
                );
            }
        }
        Command::Identities => {
            for identity in storage.list_identities().await? {
                println!(
                    "{}\tname={:?}\tavatar_set={}\tcustom_mxid={}",
                    identity.remote_id,
                    identity.name,
                    identity.avatar_set,
                    identity.custom_mxid.map(|id| id.0).unwrap_or_default(),
                );
            }
        }
        Command::Logout { user } => {
            let user_id = UserId::new(user);
            let account = linked_account(&storage, &user_id).await?;
            if let Some(aci) = &account.remote_id {
                let removed = storage.delete_device(aci).await?;
                println!("device for {aci} removed={removed}");
            }
            if let Some(mut identity) = storage.identity_by_custom_mxid(&user_id).await? {
                identity.custom_mxid = None;
                storage.update_identity(&identity).await?;
                println!("unlinked double puppet {}", identity.remote_id);
            }
        }
        Command::PurgeKeys { user } => {
            let user_id = UserId::new(user);
            let account = linked_account(&storage, &user_id).await?;
            if let Some(aci) = &account.remote_id {
                let purged = storage.clear_device_keys(aci).await?;
                println!("keys for {aci} purged={purged}");
            }
        }
    }

    Ok(())
}

async fn linked_account(storage: &Storage, user_id: &UserId) -> Result<StoredAccount> {
    match storage.get_account(user_id).await? {
        Some(account) if account.is_logged_in() => Ok(account),
        Some(_) => bail!("{user_id} has no linked remote account"),
        None => bail!("unknown account {user_id}"),
    }
}
