//! kubeadm provisioning strategy: host preparation plus the
//! bootstrap/join/CNI/destroy protocol, driven over remote shells.

pub mod kubeadm;
pub mod preparer;

pub use kubeadm::{
    extract_certificate_key, extract_join_command, KubeadmProvisioner, PROVIDER_NAME,
};
pub use preparer::HostPreparer;
