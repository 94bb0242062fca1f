//! Per-request subject attributes.
//!
//! Identity is not something this crate authenticates. Upstream middleware is
//! expected to attach a [`UserInfo`] (and optionally a [`TenantInfo`]) to the
//! request extensions; everything else is derived from the method and a
//! Kubernetes-style path such as
//! `/apis/apps/v1/tenants/acme/namespaces/default/deployments/web/scale`.

use crate::bucket::RuleField;
use http::{Method, Request};

/// Authenticated user, attached to request extensions by upstream middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub groups: Vec<String>,
}

impl UserInfo {
    pub fn new<I, G>(name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<String>,
    {
        Self { name: name.into(), groups: groups.into_iter().map(Into::into).collect() }
    }
}

/// Tenant identity, attached to request extensions by upstream middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantInfo {
    pub name: String,
    pub workspace: String,
    pub cluster: String,
}

/// Attributes rules are matched against. Computed fresh for every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub user: UserInfo,
    pub tenant: TenantInfo,
    pub namespace: String,
    pub name: String,
    pub verb: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub path: String,
}

impl Subject {
    /// Derive the subject from request extensions, method and path.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let mut subject = Subject {
            user: req.extensions().get::<UserInfo>().cloned().unwrap_or_default(),
            tenant: req.extensions().get::<TenantInfo>().cloned().unwrap_or_default(),
            path: req.uri().path().to_string(),
            ..Default::default()
        };
        let watch = req
            .uri()
            .query()
            .map(|q| q.split('&').any(|kv| kv == "watch=true" || kv == "watch=1"))
            .unwrap_or(false);
        subject.parse_path(req.method(), watch);
        subject
    }

    fn parse_path(&mut self, method: &Method, watch: bool) {
        let segments: Vec<&str> = self.path.split('/').filter(|s| !s.is_empty()).collect();
        let rest = match segments.as_slice() {
            ["api", version, rest @ ..] => {
                self.api_version = (*version).to_string();
                rest
            }
            ["apis", group, version, rest @ ..] => {
                self.api_group = (*group).to_string();
                self.api_version = (*version).to_string();
                rest
            }
            _ => {
                self.verb = method.as_str().to_ascii_lowercase();
                return;
            }
        };

        let rest = match rest {
            ["tenants", tenant, tail @ ..] if !tail.is_empty() => {
                if self.tenant.name.is_empty() {
                    self.tenant.name = (*tenant).to_string();
                }
                tail
            }
            other => other,
        };
        let rest = match rest {
            ["namespaces", namespace, tail @ ..] if !tail.is_empty() => {
                self.namespace = (*namespace).to_string();
                tail
            }
            other => other,
        };

        match rest {
            [] => {}
            [resource] => self.resource = (*resource).to_string(),
            [resource, name] => {
                self.resource = (*resource).to_string();
                self.name = (*name).to_string();
            }
            [resource, name, subresource, ..] => {
                self.resource = (*resource).to_string();
                self.name = (*name).to_string();
                self.subresource = (*subresource).to_string();
            }
        }
        if self.resource == "namespaces" && self.namespace.is_empty() {
            self.namespace = self.name.clone();
        }

        let named = !self.name.is_empty();
        let read = *method == Method::GET || *method == Method::HEAD;
        self.verb = if read && watch {
            "watch".to_string()
        } else if read {
            if named { "get" } else { "list" }.to_string()
        } else if *method == Method::POST {
            "create".to_string()
        } else if *method == Method::PUT {
            "update".to_string()
        } else if *method == Method::PATCH {
            "patch".to_string()
        } else if *method == Method::DELETE {
            if named { "delete" } else { "deletecollection" }.to_string()
        } else {
            method.as_str().to_ascii_lowercase()
        };
    }

    /// Values the subject exposes for `field`. Only `UserGroups` yields more
    /// than one.
    pub fn values(&self, field: RuleField) -> Vec<&str> {
        let single = match field {
            RuleField::UserGroups => {
                return self.user.groups.iter().map(String::as_str).collect();
            }
            RuleField::UserName => &self.user.name,
            RuleField::Namespace => &self.namespace,
            RuleField::Name => &self.name,
            RuleField::Verb => &self.verb,
            RuleField::ApiGroup => &self.api_group,
            RuleField::ApiVersion => &self.api_version,
            RuleField::Resource => &self.resource,
            RuleField::Subresource => &self.subresource,
            RuleField::TenantName => &self.tenant.name,
            RuleField::TenantWorkspace => &self.tenant.workspace,
            RuleField::TenantCluster => &self.tenant.cluster,
            RuleField::Path => &self.path,
        };
        vec![single.as_str()]
    }
}
