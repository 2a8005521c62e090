//! Global address list federation
//!
//! GAL searches merge results from zero, one, or two sources: the engine's
//! own store and an externally configured directory. "Both" mode splits the
//! result budget in half, merges the matches (the sources are disjoint, so
//! the merge is de-duplicated by construction), and returns the later of
//! the two sync tokens. Because the underlying time comparison is
//! greater-or-equal, a freshly observed token is advanced by one second
//! before it is returned, so the next incremental sync does not re-fetch
//! what this one already saw.

use crate::directory::{DirEntry, Filter, SearchOptions, SearchScope};
use crate::domain::{names, DomainKey, EntityKind};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use chrono::{Duration, NaiveDateTime};

const A_GAL_LDAP_URL: &str = "provisGalLdapURL";
const A_GAL_LDAP_SEARCH_BASE: &str = "provisGalLdapSearchBase";

/// Earliest possible sync token, used when an incremental sync starts from
/// nothing
const EPOCH_TOKEN: &str = "19700101000000Z";
const TOKEN_FORMAT: &str = "%Y%m%d%H%M%SZ";

/// Which sources a GAL search consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalMode {
    Internal,
    External,
    Both,
}

impl GalMode {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("external") => GalMode::External,
            Some("both") => GalMode::Both,
            _ => GalMode::Internal,
        }
    }
}

/// What kind of entries to search for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalType {
    All,
    Account,
    Resource,
    Group,
}

/// A GAL search request
#[derive(Debug, Clone)]
pub struct GalSearchParams {
    pub domain: String,
    pub query: String,
    pub gal_type: GalType,
    /// Override the domain's configured mode
    pub mode: Option<GalMode>,
    /// Incremental sync: only entries changed at or after this token
    pub sync_token: Option<String>,
    /// Combined result budget; 0 uses the domain or engine default
    pub limit: usize,
}

impl GalSearchParams {
    pub fn new(domain: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            query: query.into(),
            gal_type: GalType::All,
            mode: None,
            sync_token: None,
            limit: 0,
        }
    }
}

/// Merged search outcome
#[derive(Debug, Clone, Default)]
pub struct GalResult {
    pub matches: Vec<DirEntry>,
    pub next_sync_token: Option<String>,
    pub truncated: bool,
}

impl Provisioning {
    pub async fn search_gal(&self, params: GalSearchParams) -> Result<GalResult> {
        let domain = self
            .get_domain(DomainKey::Name(params.domain.clone()), false)
            .await?
            .ok_or_else(|| AppError::not_found("domain", &params.domain))?;

        let mode = params
            .mode
            .unwrap_or_else(|| GalMode::from_attr(domain.attrs.get(names::A_GAL_MODE)));
        let budget = if params.limit > 0 {
            params.limit
        } else {
            domain
                .attrs
                .get_i64(names::A_GAL_MAX_RESULTS)
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(self.config().gal.max_results as usize)
        };

        match mode {
            GalMode::Internal => self.gal_internal(&domain.name, &params, budget).await,
            GalMode::External => self.gal_external(&domain.attrs, &params, budget).await,
            GalMode::Both => {
                // half the budget each; the sources are disjoint so the
                // merged list needs no dedup pass
                let half = budget.div_ceil(2);
                let internal = self.gal_internal(&domain.name, &params, half).await?;
                let external = self
                    .gal_external(&domain.attrs, &params, budget - internal.matches.len().min(half))
                    .await?;

                let mut matches = internal.matches;
                matches.extend(external.matches);
                Ok(GalResult {
                    matches,
                    next_sync_token: later_token(
                        internal.next_sync_token,
                        external.next_sync_token,
                    ),
                    truncated: internal.truncated || external.truncated,
                })
            }
        }
    }

    async fn gal_internal(
        &self,
        domain_name: &str,
        params: &GalSearchParams,
        budget: usize,
    ) -> Result<GalResult> {
        let base = self.dit().domain_dn(domain_name);
        let opts = SearchOptions {
            size_limit: budget,
            page_size: self.config().gal.page_size,
            ..Default::default()
        };

        // primary search; for type `all` resources are unioned in after
        let primary = self
            .store()
            .search(
                &base,
                SearchScope::Subtree,
                &gal_filter(params, primary_type_filter(params.gal_type)),
                &opts,
            )
            .await?;
        let mut matches = primary.entries;
        let mut truncated = primary.truncated;

        if params.gal_type == GalType::All && matches.len() < budget {
            let remaining = budget - matches.len();
            let resources = self
                .store()
                .search(
                    &base,
                    SearchScope::Subtree,
                    &gal_filter(
                        params,
                        Filter::object_class(EntityKind::CalendarResource.object_class()),
                    ),
                    &SearchOptions {
                        size_limit: remaining,
                        page_size: self.config().gal.page_size,
                        ..Default::default()
                    },
                )
                .await?;
            matches.extend(resources.entries);
            truncated = truncated || resources.truncated;
        }

        let next_sync_token = next_token(&matches, params.sync_token.as_deref());
        Ok(GalResult {
            matches,
            next_sync_token,
            truncated,
        })
    }

    async fn gal_external(
        &self,
        domain_attrs: &crate::domain::AttrMap,
        params: &GalSearchParams,
        budget: usize,
    ) -> Result<GalResult> {
        let url = domain_attrs
            .get(A_GAL_LDAP_URL)
            .ok_or_else(|| AppError::InvalidInput("external GAL has no URL configured".to_string()))?;
        let base = domain_attrs.get(A_GAL_LDAP_SEARCH_BASE).unwrap_or_default();

        let page = self
            .external()
            .search(
                url,
                base,
                &gal_filter(params, primary_type_filter(params.gal_type)),
                &SearchOptions {
                    size_limit: budget,
                    page_size: self.config().gal.page_size,
                    ..Default::default()
                },
            )
            .await?;

        let next_sync_token = next_token(&page.entries, params.sync_token.as_deref());
        Ok(GalResult {
            matches: page.entries,
            next_sync_token,
            truncated: page.truncated,
        })
    }
}

fn primary_type_filter(gal_type: GalType) -> Filter {
    let account = Filter::and(vec![
        Filter::object_class(EntityKind::Account.object_class()),
        Filter::Not(Box::new(Filter::object_class(
            EntityKind::CalendarResource.object_class(),
        ))),
    ]);
    let group = Filter::object_class(EntityKind::DistributionList.object_class());
    match gal_type {
        GalType::Account => account,
        GalType::Resource => Filter::object_class(EntityKind::CalendarResource.object_class()),
        GalType::Group => group,
        // resources are unioned in separately, against the remaining budget
        GalType::All => Filter::or(vec![account, group]),
    }
}

fn gal_filter(params: &GalSearchParams, type_filter: Filter) -> Filter {
    let mut parts = vec![type_filter];
    match &params.sync_token {
        Some(token) => {
            // greater-or-equal is all the protocol offers
            parts.push(Filter::Ge(
                names::A_MODIFIED_TIMESTAMP.to_string(),
                if token.is_empty() {
                    EPOCH_TOKEN.to_string()
                } else {
                    token.clone()
                },
            ));
        }
        None => {
            if !params.query.is_empty() {
                let query = params.query.clone();
                parts.push(Filter::or(
                    ["cn", names::A_MAIL, "displayName", "givenName", "sn"]
                        .iter()
                        .map(|attr| Filter::Contains(attr.to_string(), query.clone()))
                        .collect(),
                ));
            }
        }
    }
    Filter::and(parts)
}

/// Compute the token to hand back: the latest change stamp observed in this
/// batch, advanced by one second; with nothing new, the supplied token
/// comes back unchanged
fn next_token(entries: &[DirEntry], supplied: Option<&str>) -> Option<String> {
    supplied?;
    let observed = entries
        .iter()
        .filter_map(|e| e.attrs.get(names::A_MODIFIED_TIMESTAMP))
        .max();
    match observed {
        Some(stamp) => Some(advance_token(stamp)),
        None => supplied.map(|t| {
            if t.is_empty() {
                EPOCH_TOKEN.to_string()
            } else {
                t.to_string()
            }
        }),
    }
}

fn advance_token(stamp: &str) -> String {
    match NaiveDateTime::parse_from_str(stamp, TOKEN_FORMAT) {
        Ok(parsed) => (parsed + Duration::seconds(1))
            .format(TOKEN_FORMAT)
            .to_string(),
        Err(_) => stamp.to_string(),
    }
}

fn later_token(left: Option<String>, right: Option<String>) -> Option<String> {
    match (left, right) {
        (Some(l), Some(r)) => Some(if l >= r { l } else { r }),
        (l, r) => l.or(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttrMap;

    #[test]
    fn test_advance_token_by_one_second() {
        assert_eq!(advance_token("20240115103000Z"), "20240115103001Z");
        assert_eq!(advance_token("20231231235959Z"), "20240101000000Z");
    }

    #[test]
    fn test_later_token() {
        assert_eq!(
            later_token(
                Some("20240115103000Z".to_string()),
                Some("20240116000000Z".to_string())
            ),
            Some("20240116000000Z".to_string())
        );
        assert_eq!(
            later_token(None, Some("20240116000000Z".to_string())),
            Some("20240116000000Z".to_string())
        );
    }

    #[test]
    fn test_next_token_keeps_supplied_when_nothing_new() {
        assert_eq!(
            next_token(&[], Some("20240115103000Z")),
            Some("20240115103000Z".to_string())
        );
        // no sync in progress: no token at all
        assert_eq!(next_token(&[], None), None);
    }

    #[test]
    fn test_next_token_advances_observed() {
        let mut attrs = AttrMap::new();
        attrs.set(names::A_MODIFIED_TIMESTAMP, "20240115103000Z");
        let entries = vec![DirEntry {
            dn: "uid=a".to_string(),
            attrs,
        }];
        assert_eq!(
            next_token(&entries, Some("")),
            Some("20240115103001Z".to_string())
        );
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(GalMode::from_attr(Some("both")), GalMode::Both);
        assert_eq!(GalMode::from_attr(Some("external")), GalMode::External);
        assert_eq!(GalMode::from_attr(None), GalMode::Internal);
    }
}
