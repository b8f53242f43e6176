pub mod configmap;
pub mod controller;
pub mod finalizer;
pub mod pdb;
pub mod reconcile;
pub mod service;
pub mod servicemonitor;
pub mod statefulset;
pub mod status;
