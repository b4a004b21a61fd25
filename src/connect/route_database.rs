//! The set of routes recently observed to fail.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::connect::Route;

/// A blacklist of failed routes, used only to deprioritize: failed routes
/// remain enumerable but are attempted after routes with no known failures.
/// Membership is advisory and may race benignly.
#[derive(Debug, Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub(crate) fn new() -> RouteDatabase {
        RouteDatabase::default()
    }

    /// Records a connection failure on `route`.
    pub(crate) fn failed(&self, route: &Route) {
        self.failed.lock().expect("route database poisoned").insert(route.clone());
    }

    /// Forgets a failure after `route` connects successfully.
    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().expect("route database poisoned").remove(route);
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().expect("route database poisoned").contains(route)
    }
}
