//! Static users and permits from the configuration file

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Backend, BackendError, Challenge, DEFAULT_IDENTIFIER, PUBLIC_IDENTIFIER};
use crate::cache::sha256_hex;
use crate::config::{ConfigError, Directive};
use crate::forward::basic_credentials;
use crate::permit::{Permit, PermitBuilder};
use crate::registry::BuildContext;
use crate::request::AccessRequest;

pub const NAME: &str = "basic";

/// Basic-auth users with statically configured permits.
///
/// Users without a password have a permit but cannot log in here; another
/// backend has to identify them.
#[derive(Debug, Default)]
pub struct StaticBackend {
    /// sha256 of the base64 credential → username
    credentials: HashMap<String, String>,
    permits: HashMap<String, Arc<Permit>>,
    default_permit: Option<Arc<Permit>>,
    public_permit: Option<Arc<Permit>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, username: &str, password: Option<&str>, permit: Permit) {
        if let Some(password) = password {
            let token = basic_credentials(username, password);
            self.credentials
                .insert(sha256_hex(&token), username.to_string());
        }
        self.permits.insert(username.to_string(), Arc::new(permit));
    }

    pub fn set_default_permit(&mut self, permit: Permit) {
        self.default_permit = Some(Arc::new(permit));
    }

    pub fn set_public_permit(&mut self, permit: Permit) {
        self.public_permit = Some(Arc::new(permit));
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn resolve_identity(&self, req: &AccessRequest) -> Result<Option<String>, BackendError> {
        Ok(req
            .basic_token()
            .and_then(|token| self.credentials.get(&sha256_hex(token)))
            .cloned())
    }

    async fn user_permit(&self, username: &str) -> Result<Option<Arc<Permit>>, BackendError> {
        Ok(self.permits.get(username).cloned())
    }

    async fn default_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        Ok(self.default_permit.clone())
    }

    async fn public_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        Ok(self.public_permit.clone())
    }

    fn login(&self, _req: &AccessRequest, realm: &str) -> Option<Challenge> {
        Some(Challenge::basic(realm))
    }
}

enum Section {
    User {
        name: String,
        password: Option<String>,
    },
    Default,
    Public,
}

impl StaticBackend {
    fn close_section(&mut self, section: Option<(Section, PermitBuilder)>) {
        let Some((section, builder)) = section else {
            return;
        };
        let permit = builder.finalize();
        match section {
            Section::User { name, password } => self.add_user(&name, password.as_deref(), permit),
            Section::Default => self.set_default_permit(permit),
            Section::Public => self.set_public_permit(permit),
        }
    }
}

pub(crate) fn factory(
    directive: &Directive,
    ctx: &BuildContext,
) -> Result<Arc<dyn Backend>, ConfigError> {
    directive.no_args()?;

    let mut backend = StaticBackend::new();
    let mut current: Option<(Section, PermitBuilder)> = None;

    for line in &directive.block {
        line.no_block()?;
        let section = match line.name.as_str() {
            "user" => {
                let (name, password) = match line.args.as_slice() {
                    [name] => (name.clone(), None),
                    [name, password] => (name.clone(), Some(password.clone())),
                    _ => {
                        return Err(ConfigError::WrongArgs {
                            directive: line.name.clone(),
                            expected: "a name and an optional password",
                            got: line.args.len(),
                            line: line.line,
                        })
                    }
                };
                Some(Section::User { name, password })
            }
            DEFAULT_IDENTIFIER | "*" => {
                line.no_args()?;
                Some(Section::Default)
            }
            PUBLIC_IDENTIFIER | "!" => {
                line.no_args()?;
                Some(Section::Public)
            }
            _ => None,
        };

        if let Some(section) = section {
            backend.close_section(current.take());
            current = Some((section, PermitBuilder::new(ctx.now)));
            continue;
        }

        let Some((_, builder)) = current.as_mut() else {
            return Err(line.unexpected("basic block before any user, default or public section"));
        };
        let path = line.single_arg()?;
        builder
            .add_rule(&line.name, path)
            .map_err(|source| ConfigError::Permission {
                line: line.line,
                source,
            })?;
    }
    backend.close_section(current);

    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_directive_tree;
    use http::header::AUTHORIZATION;
    use http::Method;

    const CONFIG: &str = r#"
basic {
    user admin password
    rw /secret/
    rw /internal/

    user george
    rw /admin/

    default
    ro /internal/

    public
    ro /
}
"#;

    fn build(input: &str) -> Result<Arc<dyn Backend>, ConfigError> {
        let tree = parse_directive_tree(input)?;
        factory(&tree[0], &BuildContext::at(1000))
    }

    fn request(authorization: Option<&str>) -> AccessRequest {
        let req = AccessRequest::new(Method::GET, "/");
        match authorization {
            Some(value) => req.with_header(AUTHORIZATION, value),
            None => req,
        }
    }

    #[tokio::test]
    async fn test_identity() {
        let backend = build(CONFIG).unwrap();

        let admin = request(Some("Basic YWRtaW46cGFzc3dvcmQ="));
        assert_eq!(
            backend.resolve_identity(&admin).await.unwrap().as_deref(),
            Some("admin")
        );

        let wrong = request(Some(&format!("Basic {}", basic_credentials("admin", "nope"))));
        assert_eq!(backend.resolve_identity(&wrong).await.unwrap(), None);
        assert_eq!(backend.resolve_identity(&request(None)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_permits() {
        let backend = build(CONFIG).unwrap();

        let admin = backend.user_permit("admin").await.unwrap().unwrap();
        assert_eq!(admin.rules().len(), 2);
        assert_eq!(admin.valid_until, 1000);

        // passwordless users keep their permit
        let george = backend.user_permit("george").await.unwrap().unwrap();
        assert!(george.check("PUT", "/admin/x", false, false).allowed);
        assert!(backend.user_permit("nobody").await.unwrap().is_none());

        let default = backend.default_permit().await.unwrap().unwrap();
        assert_eq!(default.rules()[0].path, "/internal/");
        let public = backend.public_permit().await.unwrap().unwrap();
        assert_eq!(public.rules()[0].path, "/");
    }

    #[tokio::test]
    async fn test_short_section_names() {
        let backend = build("basic {\n*\nro /a/\n!\nro /b/\n}\n").unwrap();
        assert!(backend.default_permit().await.unwrap().is_some());
        assert!(backend.public_permit().await.unwrap().is_some());
    }

    #[test]
    fn test_login_challenge() {
        let backend = build(CONFIG).unwrap();
        assert_eq!(
            backend.login(&request(None), "Files"),
            Some(Challenge::Unauthorized {
                realm: "Files".to_string()
            })
        );
    }

    #[test]
    fn test_errors() {
        let err = build("basic {\nro /orphan/\n}").unwrap_err();
        assert!(matches!(err, ConfigError::UnexpectedDirective { line: 2, .. }));

        let err = build("basic {\nuser a b c\n}").unwrap_err();
        assert!(matches!(err, ConfigError::WrongArgs { line: 2, .. }));

        let err = build("basic {\npublic\nro\n}").unwrap_err();
        assert!(matches!(err, ConfigError::WrongArgs { line: 3, .. }));

        let err = build("basic {\npublic\nGET,,PUT /x\n}").unwrap_err();
        assert!(matches!(err, ConfigError::Permission { line: 3, .. }));
    }
}
