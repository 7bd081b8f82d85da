/// Collection names for one application id. Everything lives under the public
/// data tree: `artifacts/<app_id>/public/data/<collection>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPaths {
    app_id: String,
}

pub const DEFAULT_APP_ID: &str = "default-app-id";

impl CollectionPaths {
    pub fn new(app_id: impl Into<String>) -> Self {
        let app_id = app_id.into();
        let app_id = if app_id.trim().is_empty() { DEFAULT_APP_ID.to_string() } else { app_id.trim().to_string() };
        Self { app_id }
    }

    pub fn app_id(&self) -> &str { &self.app_id }

    fn public(&self, name: &str) -> String { format!("artifacts/{}/public/data/{}", self.app_id, name) }

    #[inline]
    pub fn user_roles(&self) -> String { self.public("user_roles") }

    #[inline]
    pub fn admin_claim(&self) -> String { self.public("admin_claim") }

    #[inline]
    pub fn documents(&self) -> String { self.public("files") }
}

impl Default for CollectionPaths {
    fn default() -> Self { Self::new(DEFAULT_APP_ID) }
}
