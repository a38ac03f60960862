/// Default root under which clusters are laid out.
pub const DEFAULT_ROOT: &str = "/relay";

/// Path layout of one cluster: `{root}/{cluster_id}/node|rule|monitor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterPaths {
    root: String,
    cluster_id: String,
}

impl ClusterPaths {
    /// Layout for `cluster_id` under `root`. A trailing slash on `root` is ignored.
    #[must_use]
    pub fn new(root: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
            cluster_id: cluster_id.into(),
        }
    }

    /// Cluster id.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// `{root}/{cluster_id}`
    #[must_use]
    pub fn cluster(&self) -> String {
        format!("{}/{}", self.root, self.cluster_id)
    }

    /// Parent of the live node entries.
    #[must_use]
    pub fn node(&self) -> String {
        format!("{}/node", self.cluster())
    }

    /// Parent of the rule entries.
    #[must_use]
    pub fn rule(&self) -> String {
        format!("{}/rule", self.cluster())
    }

    /// Parent of the monitor entries.
    #[must_use]
    pub fn monitor(&self) -> String {
        format!("{}/monitor", self.cluster())
    }

    /// Entry of the node identified by `id` (`host:port`).
    #[must_use]
    pub fn node_entry(&self, id: &str) -> String {
        join(&self.node(), id)
    }

    /// Metrics entry of the node identified by `id` (`host:port`).
    #[must_use]
    pub fn monitor_entry(&self, id: &str) -> String {
        join(&self.monitor(), id)
    }
}

/// Append `name` to `path`.
#[must_use]
pub fn join(path: &str, name: &str) -> String {
    if path == "/" {
        format!("/{name}")
    } else {
        format!("{path}/{name}")
    }
}

/// Parent of `path`, or `None` for the root.
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// Last segment of `path`.
#[must_use]
pub fn child_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
