//! Helper methods only available for tests
use kube::Resource;

use crate::{Role, SonarQubeServer, SonarQubeServerSpec, SonarQubeServerStatus};

impl SonarQubeServer {
    /// A standalone test server
    pub fn test() -> Self {
        let mut s = SonarQubeServer::new("test", SonarQubeServerSpec::default());
        s.meta_mut().namespace = Some("default".into());
        s.meta_mut().uid = Some("0000-00-00-00-000000".into());
        s
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.spec.role = role;
        self
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.spec.size = Some(size);
        self
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.spec.secret = secret.into();
        self
    }

    /// Set the application and search peer lists
    pub fn with_hosts(mut self, hosts: &[&str], search_hosts: &[&str]) -> Self {
        self.spec.hosts = hosts.iter().map(|h| h.to_string()).collect();
        self.spec.search_hosts = search_hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: SonarQubeServerStatus) -> Self {
        self.status = Some(status);
        self
    }
}
