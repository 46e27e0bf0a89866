//! Peer capabilities.
//!
//! A capability set is the quintuple a peer advertises in CER/CEA:
//! supported vendors, auth applications, acct applications, and the
//! vendor-specific auth/acct application pairs. Capability negotiation
//! intersects the local declaration with what the peer reported.

use std::collections::HashSet;

/// A (vendor, application) pair from a Vendor-Specific-Application-Id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VendorApplication {
    pub vendor_id: u32,
    pub application_id: u32,
}

impl VendorApplication {
    pub fn new(vendor_id: u32, application_id: u32) -> Self {
        Self { vendor_id, application_id }
    }
}

/// The advertised or negotiated capability quintuple.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capability {
    pub supported_vendors: HashSet<u32>,
    pub auth_apps: HashSet<u32>,
    pub acct_apps: HashSet<u32>,
    pub auth_vendor_apps: HashSet<VendorApplication>,
    pub acct_vendor_apps: HashSet<VendorApplication>,
}

impl Capability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_supported_vendor(&mut self, vendor_id: u32) {
        self.supported_vendors.insert(vendor_id);
    }

    pub fn add_auth_app(&mut self, application_id: u32) {
        self.auth_apps.insert(application_id);
    }

    pub fn add_acct_app(&mut self, application_id: u32) {
        self.acct_apps.insert(application_id);
    }

    pub fn add_vendor_auth_app(&mut self, vendor_id: u32, application_id: u32) {
        self.auth_vendor_apps.insert(VendorApplication::new(vendor_id, application_id));
    }

    pub fn add_vendor_acct_app(&mut self, vendor_id: u32, application_id: u32) {
        self.acct_vendor_apps.insert(VendorApplication::new(vendor_id, application_id));
    }

    /// True when every one of the five sets is empty.
    pub fn is_empty(&self) -> bool {
        self.supported_vendors.is_empty()
            && self.auth_apps.is_empty()
            && self.acct_apps.is_empty()
            && self.auth_vendor_apps.is_empty()
            && self.acct_vendor_apps.is_empty()
    }

    pub fn is_allowed_auth_app(&self, application_id: u32) -> bool {
        self.auth_apps.contains(&application_id)
    }

    pub fn is_allowed_acct_app(&self, application_id: u32) -> bool {
        self.acct_apps.contains(&application_id)
    }

    pub fn is_allowed_vendor_auth_app(&self, vendor_id: u32, application_id: u32) -> bool {
        self.auth_vendor_apps.contains(&VendorApplication::new(vendor_id, application_id))
    }

    pub fn is_allowed_vendor_acct_app(&self, vendor_id: u32, application_id: u32) -> bool {
        self.acct_vendor_apps.contains(&VendorApplication::new(vendor_id, application_id))
    }

    /// Intersection of a local declaration with a peer report. This is
    /// the default authorization outcome of capability negotiation.
    pub fn intersect(ours: &Capability, theirs: &Capability) -> Capability {
        Capability {
            supported_vendors: ours.supported_vendors.intersection(&theirs.supported_vendors).copied().collect(),
            auth_apps: ours.auth_apps.intersection(&theirs.auth_apps).copied().collect(),
            acct_apps: ours.acct_apps.intersection(&theirs.acct_apps).copied().collect(),
            auth_vendor_apps: ours.auth_vendor_apps.intersection(&theirs.auth_vendor_apps).copied().collect(),
            acct_vendor_apps: ours.acct_vendor_apps.intersection(&theirs.acct_vendor_apps).copied().collect(),
        }
    }
}
