//! Handler registry: endpoints, mocks, pub/sub subscription callbacks and the
//! declared auth-data schema.
//!
//! Populated once by generated registration code before the server starts
//! serving; lookups afterwards are read-heavy and lock-free where possible.
use std::{
    any::{Any, TypeId},
    sync::{Arc, Mutex, OnceLock},
};

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::{
    core::desc::ApiEndpoint,
    error::{ApiError, ApiResult},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("endpoint {0} is already registered")]
    DuplicateEndpoint(String),

    #[error("subscription {0} is already registered")]
    DuplicateSubscription(String),

    #[error("an auth data type is already registered ({0})")]
    AuthDataAlreadyRegistered(&'static str),
}

/// A registered test double for one endpoint.
#[derive(Clone)]
pub struct Mock {
    /// Type-erased [`crate::core::desc::MockHandler`]; downcast at call time.
    pub handler: Arc<dyn Any + Send + Sync>,
    /// Whether the middleware chain still runs around the mock.
    pub run_middleware: bool,
}

/// Callback invoked for push-delivered pub/sub messages.
pub type SubscriptionHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ApiResult<()>> + Send + Sync>;

struct AuthDataType {
    type_id: TypeId,
    type_name: &'static str,
}

type EndpointKey = (String, String);

#[derive(Default)]
pub struct Registry {
    endpoints: scc::HashMap<EndpointKey, Arc<dyn ApiEndpoint>>,
    // Registration order, for deterministic route-table construction.
    order: Mutex<Vec<Arc<dyn ApiEndpoint>>>,
    mocks: scc::HashMap<EndpointKey, Mock>,
    subscriptions: scc::HashMap<String, SubscriptionHandler>,
    auth_data: OnceLock<AuthDataType>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_endpoint(&self, endpoint: Arc<dyn ApiEndpoint>) -> Result<(), RegistryError> {
        let entry = endpoint.entry();
        let key = (entry.service.clone(), entry.endpoint.clone());
        let name = entry.name();
        if self.endpoints.insert_sync(key, endpoint.clone()).is_err() {
            return Err(RegistryError::DuplicateEndpoint(name));
        }
        if let Ok(mut order) = self.order.lock() {
            order.push(endpoint);
        }
        Ok(())
    }

    pub fn endpoint(&self, service: &str, endpoint: &str) -> Option<Arc<dyn ApiEndpoint>> {
        self.endpoints
            .read_sync(&(service.to_string(), endpoint.to_string()), |_, v| v.clone())
    }

    /// All endpoints in registration order.
    pub fn endpoints(&self) -> Vec<Arc<dyn ApiEndpoint>> {
        self.order.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Install (or replace) a mock for one endpoint.
    pub fn set_mock(
        &self,
        service: &str,
        endpoint: &str,
        handler: Arc<dyn Any + Send + Sync>,
        run_middleware: bool,
    ) {
        let key = (service.to_string(), endpoint.to_string());
        let mock = Mock {
            handler,
            run_middleware,
        };
        if let Err((key, mock)) = self.mocks.insert_sync(key, mock.clone()) {
            self.mocks.update_sync(&key, |_, v| *v = mock);
        }
    }

    pub fn clear_mock(&self, service: &str, endpoint: &str) {
        self.mocks
            .remove_sync(&(service.to_string(), endpoint.to_string()));
    }

    pub fn mock_for(&self, service: &str, endpoint: &str) -> Option<Mock> {
        self.mocks
            .read_sync(&(service.to_string(), endpoint.to_string()), |_, v| v.clone())
    }

    pub fn register_subscription(
        &self,
        subscription_id: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), RegistryError> {
        if self
            .subscriptions
            .insert_sync(subscription_id.to_string(), handler)
            .is_err()
        {
            return Err(RegistryError::DuplicateSubscription(
                subscription_id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<SubscriptionHandler> {
        self.subscriptions
            .read_sync(&subscription_id.to_string(), |_, v| v.clone())
    }

    /// Declare the app's auth-data type. At most one per app.
    pub fn register_auth_data<T: Any>(&self) -> Result<(), RegistryError> {
        let new = AuthDataType {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        };
        let mut installed_now = false;
        let existing = self.auth_data.get_or_init(|| {
            installed_now = true;
            new
        });
        // get_or_init keeps the first registration; flag a second distinct one.
        if installed_now || existing.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(RegistryError::AuthDataAlreadyRegistered(existing.type_name))
        }
    }

    /// Validate a produced auth-data value against the declared type.
    /// With no declared type any value passes.
    pub fn check_auth_data(&self, data: &Arc<dyn Any + Send + Sync>) -> ApiResult<()> {
        let Some(declared) = self.auth_data.get() else {
            return Ok(());
        };
        if (**data).type_id() == declared.type_id {
            Ok(())
        } else {
            Err(ApiError::internal(format!(
                "auth data does not match the declared type {}",
                declared.type_name
            )))
        }
    }

    pub fn auth_data_type_name(&self) -> Option<&'static str> {
        self.auth_data.get().map(|d| d.type_name)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;
    use crate::core::desc::{Access, EndpointDesc, EndpointEntry, TypedHandler};

    fn entry(service: &str, endpoint: &str) -> EndpointEntry {
        EndpointEntry {
            service: service.into(),
            endpoint: endpoint.into(),
            access: Access::Public,
            expose: true,
            methods: vec!["POST".into()],
            path: format!("/{}.{}", service, endpoint),
            raw: false,
            fallback: false,
        }
    }

    fn echo_endpoint(service: &str, endpoint: &str) -> Arc<dyn ApiEndpoint> {
        let handler: TypedHandler<serde_json::Value, serde_json::Value> =
            Arc::new(|req| async move { Ok(req) }.boxed());
        EndpointDesc::new(entry(service, endpoint), handler)
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = Registry::new();
        reg.register_endpoint(echo_endpoint("users", "Get")).unwrap();
        reg.register_endpoint(echo_endpoint("users", "List")).unwrap();

        assert!(reg.endpoint("users", "Get").is_some());
        assert!(reg.endpoint("users", "Missing").is_none());
        let order: Vec<String> = reg
            .endpoints()
            .iter()
            .map(|e| e.entry().endpoint.clone())
            .collect();
        assert_eq!(order, vec!["Get", "List"]);
    }

    #[test]
    fn test_duplicate_endpoint_is_rejected() {
        let reg = Registry::new();
        reg.register_endpoint(echo_endpoint("users", "Get")).unwrap();
        assert!(matches!(
            reg.register_endpoint(echo_endpoint("users", "Get")),
            Err(RegistryError::DuplicateEndpoint(_))
        ));
    }

    #[test]
    fn test_mock_install_and_replace() {
        let reg = Registry::new();
        assert!(reg.mock_for("users", "Get").is_none());

        reg.set_mock("users", "Get", Arc::new(1u32), false);
        assert!(!reg.mock_for("users", "Get").unwrap().run_middleware);

        reg.set_mock("users", "Get", Arc::new(2u32), true);
        assert!(reg.mock_for("users", "Get").unwrap().run_middleware);

        reg.clear_mock("users", "Get");
        assert!(reg.mock_for("users", "Get").is_none());
    }

    #[test]
    fn test_subscription_lookup() {
        let reg = Registry::new();
        let handler: SubscriptionHandler = Arc::new(|_msg| async { Ok(()) }.boxed());
        reg.register_subscription("orders-sub", handler.clone())
            .unwrap();

        assert!(reg.subscription("orders-sub").is_some());
        assert!(reg.subscription("unknown").is_none());
        assert!(matches!(
            reg.register_subscription("orders-sub", handler),
            Err(RegistryError::DuplicateSubscription(_))
        ));
    }

    #[test]
    fn test_auth_data_type_check() {
        #[derive(Debug)]
        struct UserData;

        let reg = Registry::new();
        // Unregistered: anything passes.
        let value: Arc<dyn Any + Send + Sync> = Arc::new(42u64);
        assert!(reg.check_auth_data(&value).is_ok());

        reg.register_auth_data::<UserData>().unwrap();
        let ok: Arc<dyn Any + Send + Sync> = Arc::new(UserData);
        assert!(reg.check_auth_data(&ok).is_ok());
        let wrong: Arc<dyn Any + Send + Sync> = Arc::new("nope");
        assert!(reg.check_auth_data(&wrong).is_err());
        assert_eq!(
            reg.auth_data_type_name(),
            Some(std::any::type_name::<UserData>())
        );
    }
}
