//! Helper methods only available for tests
use kube::Resource;

use crate::{SonarQube, SonarQubeSpec, SonarQubeStatus};

impl SonarQube {
    /// A normal test cluster
    pub fn test() -> Self {
        let mut sq = SonarQube::new("test", SonarQubeSpec::default());
        sq.meta_mut().namespace = Some("default".into());
        sq.meta_mut().uid = Some("0000-00-00-00-000000".into());
        sq
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.spec.size = Some(size);
        self
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.spec.secret = secret.into();
        self
    }

    /// Modify a cluster to have an expected status
    pub fn with_status(mut self, status: SonarQubeStatus) -> Self {
        self.status = Some(status);
        self
    }
}
