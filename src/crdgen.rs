use kube::CustomResourceExt;

use oadp_non_admin::api::v1alpha1::{
    NonAdminBackup, NonAdminBackupStorageLocation, NonAdminDownloadRequest, NonAdminRestore,
};

fn main() {
    let crds = [
        NonAdminBackup::crd(),
        NonAdminRestore::crd(),
        NonAdminBackupStorageLocation::crd(),
        NonAdminDownloadRequest::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
