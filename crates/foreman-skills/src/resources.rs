use serde::{Deserialize, Serialize};

/// A resource a capability touches beyond its input and output.
///
/// An empty list means the concrete scope is supplied at runtime, so any
/// grant of the same kind covers it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    FileRead {
        #[serde(default)]
        paths: Vec<String>,
    },
    FileWrite {
        #[serde(default)]
        paths: Vec<String>,
    },
    Process {
        #[serde(default)]
        commands: Vec<String>,
    },
    Network {
        #[serde(default)]
        hosts: Vec<String>,
    },
    /// Calls to the configured language model.
    Llm,
}

impl Resource {
    fn kind_name(&self) -> &'static str {
        match self {
            Resource::FileRead { .. } => "file_read",
            Resource::FileWrite { .. } => "file_write",
            Resource::Process { .. } => "process",
            Resource::Network { .. } => "network",
            Resource::Llm => "llm",
        }
    }

    fn scope(&self) -> &[String] {
        match self {
            Resource::FileRead { paths } | Resource::FileWrite { paths } => paths,
            Resource::Process { commands } => commands,
            Resource::Network { hosts } => hosts,
            Resource::Llm => &[],
        }
    }
}

/// The set of resources capabilities are allowed to touch in this run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGrant {
    resources: Vec<Resource>,
}

impl ResourceGrant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant every kind with an unrestricted (`*`) scope.
    pub fn allow_all() -> Self {
        let any = || vec!["*".to_string()];
        Self {
            resources: vec![
                Resource::FileRead { paths: any() },
                Resource::FileWrite { paths: any() },
                Resource::Process { commands: any() },
                Resource::Network { hosts: any() },
                Resource::Llm,
            ],
        }
    }

    pub fn grant(&mut self, resource: Resource) {
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Whether a declared resource is covered by this grant.
    pub fn permits(&self, declared: &Resource) -> bool {
        let grants: Vec<&Resource> = self
            .resources
            .iter()
            .filter(|g| g.kind_name() == declared.kind_name())
            .collect();
        if grants.is_empty() {
            return false;
        }
        declared.scope().iter().all(|wanted| {
            grants
                .iter()
                .any(|g| g.scope().iter().any(|allowed| scope_covers(allowed, wanted)))
        })
    }

    /// First declared resource not covered by the grant, if any.
    pub fn first_denied<'a>(&self, declared: &'a [Resource]) -> Option<&'a Resource> {
        declared.iter().find(|r| !self.permits(r))
    }
}

fn scope_covers(allowed: &str, wanted: &str) -> bool {
    allowed == "*" || wanted.starts_with(allowed)
}
