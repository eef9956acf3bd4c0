#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort,
            ServiceSpec,
        },
    },
    NamespaceResourceScope,
};
pub use kube::{
    api::{ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};
