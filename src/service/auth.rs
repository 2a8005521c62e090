//! Authentication and password policy enforcement
//!
//! Every attempt runs the same machine: status check, lockout check,
//! mechanism dispatch, then aging and must-change checks. External callers
//! only ever see `AuthFailed` with a reason string; which stage rejected
//! the attempt is never encoded in the error variant. Policy failures on a
//! password change are `PolicyViolation`, a distinct variant, because the
//! caller may legitimately react to those (prompt for a stronger password).

use crate::crypto::{self, preauth::signatures_match, PreAuthParams};
use crate::directory::{Filter, Modification, SearchOptions};
use crate::domain::{names, AccountKey, AccountStatus, Entity, PasswordPolicy};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::sync::Arc;

const GENERALIZED_TIME: &str = "%Y%m%d%H%M%S%.3fZ";

/// How a domain verifies credentials, from its `provisAuthMech` attribute
#[derive(Debug, Clone, PartialEq)]
pub enum AuthMechanism {
    /// Compare against the stored salted hash
    Internal,
    /// Bind against an external directory as a templated DN
    ExternalBind { url: String, bind_dn_template: String },
    /// Search the external directory for the entry, then bind as it
    ExternalSearchBind {
        url: String,
        search_base: String,
        filter_template: String,
    },
}

impl AuthMechanism {
    /// Dispatch from the account's (inherited) attributes. `ldap` with a
    /// search filter configured means search-then-bind; with a bind DN
    /// template it means direct bind.
    pub fn from_attrs(attrs: &crate::domain::AttrMap) -> Self {
        match attrs.get(names::A_AUTH_MECH) {
            Some("ldap") => {
                let url = attrs
                    .get(names::A_AUTH_LDAP_URL)
                    .unwrap_or_default()
                    .to_string();
                if let Some(filter) = attrs.get(names::A_AUTH_LDAP_SEARCH_FILTER) {
                    AuthMechanism::ExternalSearchBind {
                        url,
                        search_base: attrs
                            .get(names::A_AUTH_LDAP_SEARCH_BASE)
                            .unwrap_or_default()
                            .to_string(),
                        filter_template: filter.to_string(),
                    }
                } else {
                    AuthMechanism::ExternalBind {
                        url,
                        bind_dn_template: attrs
                            .get(names::A_AUTH_LDAP_BIND_DN)
                            .unwrap_or_default()
                            .to_string(),
                    }
                }
            }
            _ => AuthMechanism::Internal,
        }
    }
}

impl Provisioning {
    /// Verify a credential for the named account.
    ///
    /// Returns the account on success so callers can mint their session
    /// without a second resolve.
    pub async fn authenticate(&self, name: &str, password: &str) -> Result<Arc<Entity>> {
        let account = self
            .get_account(AccountKey::Name(name.to_string()), false)
            .await?
            .ok_or_else(|| AppError::auth_failed("account not found"))?;
        let policy = PasswordPolicy::from_attrs(&account.attrs);

        check_status(&account)?;
        check_lockout(&account, &policy)?;

        let verified = match AuthMechanism::from_attrs(&account.attrs) {
            AuthMechanism::Internal => self.verify_internal(&account, password)?,
            mechanism => match self.verify_external(&account, password, &mechanism).await {
                Ok(verdict) => verdict,
                // the mechanism failed to execute (not a rejected
                // credential): fall back to the internal hash only when the
                // account is permitted to
                Err(err) => {
                    if account.attrs.get_bool(names::A_AUTH_FALLBACK).unwrap_or(false) {
                        tracing::warn!(%err, name = %account.name, "external auth unavailable, falling back to internal");
                        self.verify_internal(&account, password)?
                    } else {
                        tracing::warn!(%err, name = %account.name, "external auth unavailable");
                        return Err(AppError::auth_failed("external authentication unavailable"));
                    }
                }
            },
        };

        if !verified {
            self.record_failed_login(&account, &policy).await;
            return Err(AppError::auth_failed("invalid credentials"));
        }
        self.record_successful_login(&account).await;

        check_password_age(&account, &policy)?;
        Ok(account)
    }

    /// Verify a preauth signature: status and lockout still apply, the
    /// credential comparison is replaced by a keyed signature over
    /// account, key kind, timestamp, and expiry, bounded by clock skew.
    pub async fn authenticate_preauth(
        &self,
        name: &str,
        preauth: &str,
        timestamp_ms: i64,
        expires_ms: i64,
    ) -> Result<Arc<Entity>> {
        let account = self
            .get_account(AccountKey::Name(name.to_string()), false)
            .await?
            .ok_or_else(|| AppError::auth_failed("account not found"))?;
        let policy = PasswordPolicy::from_attrs(&account.attrs);

        check_status(&account)?;
        check_lockout(&account, &policy)?;

        let domain = self
            .get_domain(
                crate::domain::DomainKey::Name(
                    account
                        .domain_part()
                        .ok_or_else(|| AppError::auth_failed("account has no domain"))?
                        .to_string(),
                ),
                false,
            )
            .await?
            .ok_or_else(|| AppError::auth_failed("no such domain"))?;
        let key = domain
            .attrs
            .get(names::A_PREAUTH_KEY)
            .ok_or_else(|| AppError::auth_failed("preauth not enabled on domain"))?;

        let now_ms = Utc::now().timestamp_millis();
        let skew_ms = self.config().auth.preauth_max_skew.as_millis() as i64;
        if (now_ms - timestamp_ms).abs() > skew_ms {
            self.record_failed_login(&account, &policy).await;
            return Err(AppError::auth_failed("preauth timestamp outside window"));
        }
        if expires_ms != 0 && now_ms > expires_ms {
            self.record_failed_login(&account, &policy).await;
            return Err(AppError::auth_failed("preauth expired"));
        }

        let expected = PreAuthParams {
            account: name.to_string(),
            by: "name".to_string(),
            timestamp_ms,
            expires_ms,
        }
        .sign(key);
        if !signatures_match(&expected, preauth) {
            self.record_failed_login(&account, &policy).await;
            return Err(AppError::auth_failed("preauth signature mismatch"));
        }

        self.record_successful_login(&account).await;
        Ok(account)
    }

    /// Accept a single-sign-on assertion: no credential of any kind, but
    /// status and lockout checks still run
    pub async fn authenticate_sso(&self, name: &str) -> Result<Arc<Entity>> {
        let account = self
            .get_account(AccountKey::Name(name.to_string()), false)
            .await?
            .ok_or_else(|| AppError::auth_failed("account not found"))?;
        let policy = PasswordPolicy::from_attrs(&account.attrs);

        check_status(&account)?;
        check_lockout(&account, &policy)?;
        self.record_successful_login(&account).await;
        Ok(account)
    }

    /// User-initiated password change: verifies the old credential, then
    /// enforces minimum age, strength, and history before writing
    pub async fn change_password(
        &self,
        name: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let account = self
            .get_account(AccountKey::Name(name.to_string()), false)
            .await?
            .ok_or_else(|| AppError::auth_failed("account not found"))?;
        let policy = PasswordPolicy::from_attrs(&account.attrs);

        check_status(&account)?;
        if !self.verify_internal(&account, old_password)? {
            self.record_failed_login(&account, &policy).await;
            return Err(AppError::auth_failed("invalid credentials"));
        }

        let must_change = account
            .attrs
            .get_bool(names::A_PASSWORD_MUST_CHANGE)
            .unwrap_or(false);
        if !must_change && policy.min_age_days > 0 {
            if let Some(changed_at) = parse_generalized_time(
                account.attrs.get(names::A_PASSWORD_MODIFIED_TIME).unwrap_or(""),
            ) {
                let eligible_at = changed_at + Duration::days(policy.min_age_days as i64);
                if Utc::now() < eligible_at {
                    return Err(AppError::PolicyViolation(
                        "password cannot be changed yet".to_string(),
                    ));
                }
            }
        }

        self.apply_new_password(&account, new_password, &policy, false)
            .await
    }

    /// Administrative password set: skips old-credential and age checks
    pub async fn set_password(
        &self,
        account: &Arc<Entity>,
        new_password: &str,
        must_change: bool,
    ) -> Result<()> {
        let policy = PasswordPolicy::from_attrs(&account.attrs);
        self.apply_new_password(account, new_password, &policy, must_change)
            .await
    }

    async fn apply_new_password(
        &self,
        account: &Arc<Entity>,
        new_password: &str,
        policy: &PasswordPolicy,
        must_change: bool,
    ) -> Result<()> {
        policy
            .validate_password(new_password)
            .map_err(|errors| AppError::PolicyViolation(errors.join("; ")))?;

        // non-repetition against the rolling history and the current hash
        if policy.history_count > 0 {
            if let Some(current) = account.attrs.get(names::A_PASSWORD) {
                if crypto::verify_password(new_password, current)? {
                    return Err(AppError::PolicyViolation(
                        "password was used recently".to_string(),
                    ));
                }
            }
            for entry in account.attrs.get_all(names::A_PASSWORD_HISTORY) {
                if let Some((_, hash)) = entry.split_once(':') {
                    if crypto::verify_password(new_password, hash)? {
                        return Err(AppError::PolicyViolation(
                            "password was used recently".to_string(),
                        ));
                    }
                }
            }
        }

        let now = Utc::now();
        let mut mods = Vec::new();

        if policy.history_count > 0 {
            if let Some(current) = account.attrs.get(names::A_PASSWORD) {
                let mut history: Vec<String> = account
                    .attrs
                    .get_all(names::A_PASSWORD_HISTORY)
                    .to_vec();
                history.push(format!("{}:{}", now.timestamp_millis(), current));
                // keep the newest N entries; the prefix sorts by time
                history.sort();
                let keep_from = history.len().saturating_sub(policy.history_count as usize);
                mods.push(Modification::Replace(
                    names::A_PASSWORD_HISTORY.to_string(),
                    history.split_off(keep_from),
                ));
            }
        } else if account.attrs.contains_key(names::A_PASSWORD_HISTORY) {
            mods.push(Modification::DeleteAttr(
                names::A_PASSWORD_HISTORY.to_string(),
            ));
        }

        mods.push(Modification::Replace(
            names::A_PASSWORD.to_string(),
            vec![crypto::hash_password(new_password)?],
        ));
        mods.push(Modification::Replace(
            names::A_PASSWORD_MODIFIED_TIME.to_string(),
            vec![now.format(GENERALIZED_TIME).to_string()],
        ));
        if must_change {
            mods.push(Modification::Replace(
                names::A_PASSWORD_MUST_CHANGE.to_string(),
                vec!["TRUE".to_string()],
            ));
        } else if account.attrs.contains_key(names::A_PASSWORD_MUST_CHANGE) {
            mods.push(Modification::DeleteAttr(
                names::A_PASSWORD_MUST_CHANGE.to_string(),
            ));
        }

        // every successful change invalidates previously issued auth tokens
        let validity = account
            .attrs
            .get_i64(names::A_AUTH_TOKEN_VALIDITY)
            .unwrap_or(0);
        mods.push(Modification::Replace(
            names::A_AUTH_TOKEN_VALIDITY.to_string(),
            vec![(validity + 1).to_string()],
        ));

        self.modify_attrs(account, mods).await?;
        tracing::info!(name = %account.name, "password changed");
        Ok(())
    }

    fn verify_internal(&self, account: &Entity, password: &str) -> Result<bool> {
        if password.is_empty() {
            return Ok(false);
        }
        match account.attrs.get(names::A_PASSWORD) {
            Some(stored) => crypto::verify_password(password, stored),
            None => Ok(false),
        }
    }

    /// Run an external mechanism. `Ok(bool)` is a verdict; `Err` means the
    /// mechanism could not be executed, which is what the fallback decision
    /// keys on.
    async fn verify_external(
        &self,
        account: &Entity,
        password: &str,
        mechanism: &AuthMechanism,
    ) -> Result<bool> {
        let local = account.local_part().unwrap_or(&account.name);
        let domain = account.domain_part().unwrap_or_default();

        match mechanism {
            AuthMechanism::Internal => self.verify_internal(account, password),
            AuthMechanism::ExternalBind {
                url,
                bind_dn_template,
            } => {
                if bind_dn_template.is_empty() {
                    return Err(AppError::InvalidInput(
                        "external auth has no bind DN template".to_string(),
                    ));
                }
                let dn = expand_template(bind_dn_template, &account.name, local, domain);
                self.external().bind(url, &dn, password).await
            }
            AuthMechanism::ExternalSearchBind {
                url,
                search_base,
                filter_template,
            } => {
                let rendered = expand_template(filter_template, &account.name, local, domain);
                let filter = Filter::from_template(&rendered);
                let page = self
                    .external()
                    .search(url, search_base, &filter, &SearchOptions::limited(2))
                    .await?;
                match page.entries.len() {
                    0 => Ok(false),
                    1 => self.external().bind(url, &page.entries[0].dn, password).await,
                    _ => Err(AppError::MultipleMatched {
                        key: rendered,
                        paths: page.entries.into_iter().map(|e| e.dn).collect(),
                    }),
                }
            }
        }
    }

    /// Lockout bookkeeping after a rejected credential. Best-effort: a
    /// failed write must not mask the authentication failure.
    async fn record_failed_login(&self, account: &Entity, policy: &PasswordPolicy) {
        if !policy.lockout_enabled || policy.lockout_threshold == 0 {
            return;
        }
        let now = Utc::now();
        let window = Duration::minutes(policy.lockout_failure_window_mins as i64);
        let mut failures: Vec<String> = account
            .attrs
            .get_all(names::A_PASSWORD_FAILURE_TIME)
            .iter()
            .filter(|raw| {
                parse_generalized_time(raw).is_some_and(|t| now - t <= window)
            })
            .cloned()
            .collect();
        failures.push(now.format(GENERALIZED_TIME).to_string());

        let mods = if failures.len() as u32 >= policy.lockout_threshold {
            tracing::warn!(name = %account.name, failures = failures.len(), "account locked out");
            vec![
                Modification::Replace(
                    names::A_ACCOUNT_STATUS.to_string(),
                    vec![AccountStatus::Lockout.as_str().to_string()],
                ),
                Modification::Replace(
                    names::A_PASSWORD_LOCKOUT_TIME.to_string(),
                    vec![now.format(GENERALIZED_TIME).to_string()],
                ),
                Modification::DeleteAttr(names::A_PASSWORD_FAILURE_TIME.to_string()),
            ]
        } else {
            vec![Modification::Replace(
                names::A_PASSWORD_FAILURE_TIME.to_string(),
                failures,
            )]
        };

        if let Err(err) = self.store().modify(&account.dn, mods).await {
            tracing::warn!(%err, name = %account.name, "lockout bookkeeping failed");
        }
        self.evict_entity(account);
    }

    /// A verified credential resets the consecutive-failure state
    async fn record_successful_login(&self, account: &Entity) {
        let mut mods = Vec::new();
        if account.attrs.contains_key(names::A_PASSWORD_FAILURE_TIME) {
            mods.push(Modification::DeleteAttr(
                names::A_PASSWORD_FAILURE_TIME.to_string(),
            ));
        }
        if account.status() == AccountStatus::Lockout {
            mods.push(Modification::Replace(
                names::A_ACCOUNT_STATUS.to_string(),
                vec![AccountStatus::Active.as_str().to_string()],
            ));
            mods.push(Modification::DeleteAttr(
                names::A_PASSWORD_LOCKOUT_TIME.to_string(),
            ));
        }
        if mods.is_empty() {
            return;
        }
        if let Err(err) = self.store().modify(&account.dn, mods).await {
            tracing::warn!(%err, name = %account.name, "failure-counter reset failed");
        }
        self.evict_entity(account);
    }
}

fn check_status(account: &Entity) -> Result<()> {
    match account.status() {
        AccountStatus::Active | AccountStatus::Lockout => Ok(()),
        AccountStatus::Locked => Err(AppError::auth_failed("account is locked")),
        // not a credential problem: the account is administratively out of
        // service
        AccountStatus::Maintenance | AccountStatus::Pending | AccountStatus::Closed => {
            Err(AppError::auth_failed(format!(
                "account status is {}",
                account.status().as_str()
            )))
        }
    }
}

/// A locked-out account fails fast, before any credential is examined. The
/// lockout expires after the configured lifetime; an expired lockout is
/// treated as active without a separate unlock write.
fn check_lockout(account: &Entity, policy: &PasswordPolicy) -> Result<()> {
    if account.status() != AccountStatus::Lockout {
        return Ok(());
    }
    if policy.lockout_duration_mins == 0 {
        return Err(AppError::auth_failed("account is locked out"));
    }
    let locked_at = account
        .attrs
        .get(names::A_PASSWORD_LOCKOUT_TIME)
        .and_then(parse_generalized_time);
    match locked_at {
        Some(locked_at)
            if Utc::now()
                < locked_at + Duration::minutes(policy.lockout_duration_mins as i64) =>
        {
            Err(AppError::auth_failed("account is locked out"))
        }
        _ => Ok(()),
    }
}

fn check_password_age(account: &Entity, policy: &PasswordPolicy) -> Result<()> {
    if account
        .attrs
        .get_bool(names::A_PASSWORD_MUST_CHANGE)
        .unwrap_or(false)
    {
        return Err(AppError::PolicyViolation(
            "password must be changed".to_string(),
        ));
    }
    if policy.max_age_days > 0 {
        if let Some(changed_at) = account
            .attrs
            .get(names::A_PASSWORD_MODIFIED_TIME)
            .and_then(parse_generalized_time)
        {
            if Utc::now() > changed_at + Duration::days(policy.max_age_days as i64) {
                return Err(AppError::PolicyViolation("password has expired".to_string()));
            }
        }
    }
    Ok(())
}

fn parse_generalized_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, GENERALIZED_TIME)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%SZ"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn expand_template(template: &str, name: &str, local: &str, domain: &str) -> String {
    template
        .replace("%n", name)
        .replace("%u", local)
        .replace("%d", domain)
}
