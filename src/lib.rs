//! Multi-tenant control plane over the Velero backup engine.
//!
//! Velero assumes cluster-admin operators: its resources live in one
//! privileged namespace and may reference any other. This crate lets
//! namespace-scoped tenants request backups and restores confined to their
//! own namespace, by reconciling NonAdmin* resources into Velero resources
//! bound through a NAC UUID label and origin annotations.

/// Tenant-facing CRDs (oadp.openshift.io/v1alpha1)
pub mod api;

/// Naming, lookup and status projection shared by all controllers
pub mod common;

/// Operator namespace and admin-enforced specs
pub mod config;

/// One controller per tenant kind, plus event fan-in
pub mod controllers;

/// Errors, condition helpers, log and metric integrations
pub mod util;

/// Typed views of the Velero resources this operator touches
pub mod velero;

#[cfg(test)]
mod tests;
