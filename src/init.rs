//! First-run provisioning for `portraitd_init`
//!
//! Creates the database file, an admin account on the top plan, its opening
//! credit grant and any provider keys the operator wants persisted.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::access::Plan;
use crate::auth::accounts::{check_new_credentials, AccountService};
use crate::catalog::ProviderKind;
use crate::credentials::CredentialResolver;
use crate::credits::CreditLedger;
use crate::db::Database;

/// What to seed besides the admin account
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub admin_credits: i64,
    pub provider_keys: Vec<(ProviderKind, String)>,
}

/// Outcome of a successful provisioning run
#[derive(Debug)]
pub struct Provisioned {
    pub admin_id: String,
    pub balance: i64,
    pub providers: Vec<ProviderKind>,
}

/// Provision a fresh database at `path`
///
/// Refuses to touch an existing file. Admin credentials are checked against
/// the same policy as self-registration before anything is written.
pub async fn init_database(
    path: &Path,
    admin_username: &str,
    admin_password: &str,
    options: InitOptions,
) -> Result<Provisioned> {
    if path.exists() {
        bail!("{} already exists; refusing to overwrite", path.display());
    }
    check_new_credentials(admin_username.trim(), admin_password)
        .context("admin credentials rejected")?;
    let location = path
        .to_str()
        .with_context(|| format!("{} is not a UTF-8 path", path.display()))?;

    let db = Database::new(Some(location)).await?;
    let pool = db.pool().clone();

    let accounts = AccountService::new(pool.clone());
    let (admin, _) = accounts.create_account(admin_username, admin_password).await?;
    accounts.set_plan(&admin.id, Plan::Ultimate).await?;

    let mut balance = 0;
    if options.admin_credits > 0 {
        balance = CreditLedger::new(pool.clone())
            .grant(&admin.id, options.admin_credits, "initial grant")
            .await?;
    }

    let credentials = CredentialResolver::new(pool);
    let mut providers = Vec::with_capacity(options.provider_keys.len());
    for (provider, key) in &options.provider_keys {
        credentials.store(*provider, key).await?;
        providers.push(*provider);
    }

    info!(
        path = %path.display(),
        admin = %admin.username,
        balance,
        providers = providers.len(),
        "Provisioned database"
    );

    Ok(Provisioned {
        admin_id: admin.id,
        balance,
        providers,
    })
}
