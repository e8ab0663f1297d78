//! Condition and event reasons, one enum per resource kind
//!
//! Each variant renders to the CamelCase string stored in conditions and
//! published on events.

macro_rules! reasons {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Every reason of this kind
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable string form used in conditions and events
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant),)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }
    };
}

reasons!(
    /// Reasons reported on a ServiceBroker
    BrokerReason {
        /// Catalog fetched and synced
        FetchedCatalog,
        /// Catalog could not be fetched
        ErrorFetchingCatalog,
        /// Catalog could not be converted or written
        ErrorSyncingCatalog,
        /// Broker credentials could not be read
        ErrorGettingAuthCredentials,
        /// Classes of the broker could not be listed
        ErrorListingServiceClasses,
        /// Plans of the broker could not be listed
        ErrorListingServicePlans,
        /// A class of the broker could not be deleted
        ErrorDeletingServiceClass,
        /// A plan of the broker could not be deleted
        ErrorDeletingServicePlan,
        /// All catalog resources removed
        DeletedSuccessfully,
        /// Reconciliation kept failing for longer than allowed
        ErrorReconciliationRetryTimeout,
    }
);

reasons!(
    /// Reasons reported on a ServiceInstance
    InstanceReason {
        /// A required spec field is empty
        ErrorValidatingSpec,
        /// The referenced class does not exist
        ReferencesNonexistentServiceClass,
        /// The referenced plan does not exist
        ReferencesNonexistentServicePlan,
        /// The class's broker does not exist
        ReferencesNonexistentBroker,
        /// Broker credentials could not be read
        ErrorGettingAuthCredentials,
        /// Parameters are not a JSON object
        ErrorWithParameters,
        /// The instance's namespace could not be read
        ErrorFindingNamespaceForInstance,
        /// The broker rejected provisioning
        ProvisionCallFailed,
        /// The provision call did not reach the broker
        ErrorCallingProvision,
        /// The broker rejected an update
        UpdateInstanceCallFailed,
        /// The update call did not reach the broker
        ErrorCallingUpdateInstance,
        /// Deprovisioning failed or its outcome is unknown
        DeprovisionCallFailed,
        /// Polling the last operation failed
        ErrorPollingLastOperation,
        /// Asynchronous provisioning in progress
        Provisioning,
        /// Asynchronous update in progress
        UpdatingInstance,
        /// Asynchronous deprovisioning in progress
        Deprovisioning,
        /// Provisioning succeeded
        ProvisionedSuccessfully,
        /// Update succeeded
        InstanceUpdatedSuccessfully,
        /// Deprovisioning succeeded
        DeprovisionedSuccessfully,
        /// Permanent failure reported by the broker
        BrokerReturnedFailure,
    }
);

reasons!(
    /// Reasons reported on a ServiceBinding
    BindingReason {
        /// A required spec field is empty
        ErrorValidatingSpec,
        /// The referenced instance does not exist
        ReferencesNonexistentInstance,
        /// The instance's class does not exist
        ReferencesNonexistentServiceClass,
        /// The instance's plan does not exist
        ReferencesNonexistentServicePlan,
        /// The class's broker does not exist
        ReferencesNonexistentBroker,
        /// Broker credentials could not be read
        ErrorGettingAuthCredentials,
        /// Parameters are not a JSON object
        ErrorWithParameters,
        /// The instance is not Ready
        ErrorInstanceNotReady,
        /// The instance has an asynchronous operation running
        ErrorAsyncOperationInProgress,
        /// Neither the class nor the plan is bindable
        ErrorNonbindableServiceClass,
        /// The broker rejected the bind
        BindCallFailed,
        /// The bind call did not reach the broker
        ErrorCallingBind,
        /// Credentials could not be written to the secret
        ErrorInjectingBindResult,
        /// Credentials written to the secret
        InjectedBindResult,
        /// Unbinding failed or its outcome is unknown
        UnbindCallFailed,
        /// Credentials secret could not be removed
        ErrorEjectingBindResult,
        /// Unbinding succeeded
        UnboundSuccessfully,
        /// Asynchronous bind in progress
        Binding,
        /// Asynchronous unbind in progress
        Unbinding,
        /// Polling the last operation failed
        ErrorPollingLastOperation,
        /// Permanent failure reported by the broker
        BrokerReturnedFailure,
    }
);
