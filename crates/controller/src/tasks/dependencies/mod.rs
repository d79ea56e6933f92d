//! Dependency provisioning table.
//!
//! Every supported backing service is a plain data record keyed by
//! [`DependencyType`]. Adding a type means adding a variant and its record;
//! the environment controller has no per-type control flow.

use crate::crds::DependencySpec;
use crate::tasks::types::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod credentials;

/// Default user created in dependencies that have one
pub const DEFAULT_USER: &str = "devuser";

/// Default database created in relational stores
pub const DEFAULT_DATABASE: &str = "devdb";

/// Where a credential value comes from when the secret has none yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialValue {
    Fixed(&'static str),
    /// Random alphanumeric value of the given length
    Generated(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialField {
    pub key: &'static str,
    pub value: CredentialValue,
}

/// An injected variable and the template producing its value.
///
/// Templates use `{host}`, `{port}` and `{<credential key>}` placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedVar {
    pub name: &'static str,
    pub template: &'static str,
}

/// Extra named port exposed next to the primary one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraPort {
    pub name: &'static str,
    pub port: i32,
}

/// Static provisioning record for one dependency type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyProfile {
    pub type_name: &'static str,
    pub image_repository: &'static str,
    pub default_tag: &'static str,
    pub port: i32,
    pub extra_ports: &'static [ExtraPort],
    pub args: &'static [&'static str],
    pub data_path: &'static str,
    pub credentials: &'static [CredentialField],
    /// First entry is the primary variable (renamed by `envVarName`)
    pub injected: &'static [InjectedVar],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyType {
    Postgres,
    Redis,
    Mysql,
    Mongodb,
    Rabbitmq,
    Minio,
}

const POSTGRES: DependencyProfile = DependencyProfile {
    type_name: "postgres",
    image_repository: "postgres",
    default_tag: "16-alpine",
    port: 5432,
    extra_ports: &[],
    args: &[],
    data_path: "/var/lib/postgresql/data",
    credentials: &[
        CredentialField {
            key: "POSTGRES_USER",
            value: CredentialValue::Fixed(DEFAULT_USER),
        },
        CredentialField {
            key: "POSTGRES_PASSWORD",
            value: CredentialValue::Generated(24),
        },
        CredentialField {
            key: "POSTGRES_DB",
            value: CredentialValue::Fixed(DEFAULT_DATABASE),
        },
    ],
    injected: &[InjectedVar {
        name: "DATABASE_URL",
        template: concat!(
            "postgres://{POSTGRES_USER}:{POSTGRES_PASSWORD}",
            "@{host}:{port}/{POSTGRES_DB}?sslmode=disable"
        ),
    }],
};

const REDIS: DependencyProfile = DependencyProfile {
    type_name: "redis",
    image_repository: "redis",
    default_tag: "7-alpine",
    port: 6379,
    extra_ports: &[],
    args: &["--save", "", "--appendonly", "no"],
    data_path: "/data",
    credentials: &[],
    injected: &[InjectedVar {
        name: "REDIS_URL",
        template: "redis://{host}:{port}/0",
    }],
};

const MYSQL: DependencyProfile = DependencyProfile {
    type_name: "mysql",
    image_repository: "mysql",
    default_tag: "8.0",
    port: 3306,
    extra_ports: &[],
    args: &[],
    data_path: "/var/lib/mysql",
    credentials: &[
        CredentialField {
            key: "MYSQL_USER",
            value: CredentialValue::Fixed(DEFAULT_USER),
        },
        CredentialField {
            key: "MYSQL_PASSWORD",
            value: CredentialValue::Generated(24),
        },
        CredentialField {
            key: "MYSQL_ROOT_PASSWORD",
            value: CredentialValue::Generated(24),
        },
        CredentialField {
            key: "MYSQL_DATABASE",
            value: CredentialValue::Fixed(DEFAULT_DATABASE),
        },
    ],
    injected: &[InjectedVar {
        name: "DATABASE_URL",
        template: "mysql://{MYSQL_USER}:{MYSQL_PASSWORD}@{host}:{port}/{MYSQL_DATABASE}",
    }],
};

const MONGODB: DependencyProfile = DependencyProfile {
    type_name: "mongodb",
    image_repository: "mongo",
    default_tag: "7",
    port: 27017,
    extra_ports: &[],
    args: &[],
    data_path: "/data/db",
    credentials: &[
        CredentialField {
            key: "MONGO_INITDB_ROOT_USERNAME",
            value: CredentialValue::Fixed(DEFAULT_USER),
        },
        CredentialField {
            key: "MONGO_INITDB_ROOT_PASSWORD",
            value: CredentialValue::Generated(24),
        },
    ],
    injected: &[InjectedVar {
        name: "MONGO_URL",
        template: concat!(
            "mongodb://{MONGO_INITDB_ROOT_USERNAME}:{MONGO_INITDB_ROOT_PASSWORD}",
            "@{host}:{port}/?authSource=admin"
        ),
    }],
};

const RABBITMQ: DependencyProfile = DependencyProfile {
    type_name: "rabbitmq",
    image_repository: "rabbitmq",
    default_tag: "3-management-alpine",
    port: 5672,
    extra_ports: &[ExtraPort {
        name: "management",
        port: 15672,
    }],
    args: &[],
    data_path: "/var/lib/rabbitmq",
    credentials: &[
        CredentialField {
            key: "RABBITMQ_DEFAULT_USER",
            value: CredentialValue::Fixed(DEFAULT_USER),
        },
        CredentialField {
            key: "RABBITMQ_DEFAULT_PASS",
            value: CredentialValue::Generated(24),
        },
    ],
    injected: &[InjectedVar {
        name: "AMQP_URL",
        template: "amqp://{RABBITMQ_DEFAULT_USER}:{RABBITMQ_DEFAULT_PASS}@{host}:{port}/",
    }],
};

const MINIO: DependencyProfile = DependencyProfile {
    type_name: "minio",
    image_repository: "minio/minio",
    default_tag: "latest",
    port: 9000,
    extra_ports: &[ExtraPort {
        name: "console",
        port: 9001,
    }],
    args: &["server", "/data", "--console-address", ":9001"],
    data_path: "/data",
    credentials: &[
        CredentialField {
            key: "MINIO_ROOT_USER",
            value: CredentialValue::Generated(20),
        },
        CredentialField {
            key: "MINIO_ROOT_PASSWORD",
            value: CredentialValue::Generated(40),
        },
    ],
    injected: &[
        InjectedVar {
            name: "S3_ENDPOINT",
            template: "http://{host}:{port}",
        },
        InjectedVar {
            name: "S3_ACCESS_KEY",
            template: "{MINIO_ROOT_USER}",
        },
        InjectedVar {
            name: "S3_SECRET_KEY",
            template: "{MINIO_ROOT_PASSWORD}",
        },
    ],
};

impl DependencyType {
    pub const ALL: [DependencyType; 6] = [
        Self::Postgres,
        Self::Redis,
        Self::Mysql,
        Self::Mongodb,
        Self::Rabbitmq,
        Self::Minio,
    ];

    #[must_use]
    pub fn profile(&self) -> &'static DependencyProfile {
        match self {
            Self::Postgres => &POSTGRES,
            Self::Redis => &REDIS,
            Self::Mysql => &MYSQL,
            Self::Mongodb => &MONGODB,
            Self::Rabbitmq => &RABBITMQ,
            Self::Minio => &MINIO,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.profile().type_name
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            "rabbitmq" | "amqp" => Ok(Self::Rabbitmq),
            "minio" | "s3" => Ok(Self::Minio),
            other => Err(Error::ValidationError(format!(
                "unsupported dependency type '{other}' (supported: {})",
                Self::ALL.map(|t| t.as_str()).join(", ")
            ))),
        }
    }
}

/// A dependency declaration merged with its table record
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDependency {
    pub dependency_type: DependencyType,
    pub image: String,
    pub port: i32,
    /// Injected variable names in table order, primary renamed by `envVarName`
    pub injected: Vec<(String, &'static str)>,
}

impl ResolvedDependency {
    /// Apply per-declaration overrides to the table record
    pub fn resolve(spec: &DependencySpec) -> Result<Self, Error> {
        let dependency_type: DependencyType = spec.dependency_type.parse()?;
        let profile = dependency_type.profile();

        let image = match (&spec.image, &spec.version) {
            (Some(image), _) if !image.trim().is_empty() => image.clone(),
            (_, Some(tag)) if !tag.trim().is_empty() => {
                format!("{}:{}", profile.image_repository, tag.trim())
            }
            _ => format!("{}:{}", profile.image_repository, profile.default_tag),
        };

        let port = spec.port.unwrap_or(profile.port);
        if !(1..=65535).contains(&port) {
            return Err(Error::ValidationError(format!(
                "dependency '{}' port {port} is out of range",
                spec.dependency_type
            )));
        }

        let injected = profile
            .injected
            .iter()
            .enumerate()
            .map(|(i, var)| {
                let name = match (&spec.env_var_name, i) {
                    (Some(name), 0) if !name.trim().is_empty() => name.trim().to_string(),
                    _ => var.name.to_string(),
                };
                (name, var.template)
            })
            .collect();

        Ok(Self {
            dependency_type,
            image,
            port,
            injected,
        })
    }

    #[must_use]
    pub fn profile(&self) -> &'static DependencyProfile {
        self.dependency_type.profile()
    }

    /// Values of every injected variable for a service reachable at `host`
    #[must_use]
    pub fn connection_env(
        &self,
        host: &str,
        credentials: &BTreeMap<String, String>,
    ) -> Vec<(String, String)> {
        self.injected
            .iter()
            .map(|(name, template)| (name.clone(), render(template, host, self.port, credentials)))
            .collect()
    }
}

fn render(template: &str, host: &str, port: i32, credentials: &BTreeMap<String, String>) -> String {
    let mut out = template
        .replace("{host}", host)
        .replace("{port}", &port.to_string());
    for (key, value) in credentials {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
