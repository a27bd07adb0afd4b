//! Directory seam wired to the real metaserver client.

use crate::MetaClient;
use async_trait::async_trait;
use skerry_core::error::Result;
use skerry_core::types::{Contract, File, Permission, ProviderInfo, RenterInfo, Version};
use skerry_metaserver::Client;

#[async_trait]
impl MetaClient for Client {
    async fn get_file(&self, renter_id: &str, file_id: &str) -> Result<File> {
        Client::get_file(self, renter_id, file_id).await
    }

    async fn get_files(&self, renter_id: &str) -> Result<Vec<File>> {
        Client::get_files(self, renter_id).await
    }

    async fn post_file(&self, renter_id: &str, file: &File) -> Result<()> {
        Client::post_file(self, renter_id, file).await
    }

    async fn delete_file(&self, renter_id: &str, file_id: &str) -> Result<()> {
        Client::delete_file(self, renter_id, file_id).await
    }

    async fn post_version(
        &self,
        renter_id: &str,
        file_id: &str,
        version: &Version,
    ) -> Result<()> {
        Client::post_version(self, renter_id, file_id, version).await
    }

    async fn delete_version(&self, renter_id: &str, file_id: &str, num: u32) -> Result<()> {
        Client::delete_version(self, renter_id, file_id, num).await
    }

    async fn get_renter(&self, renter_id: &str) -> Result<RenterInfo> {
        Client::get_renter(self, renter_id).await
    }

    async fn post_permission(
        &self,
        renter_id: &str,
        file_id: &str,
        permission: &Permission,
    ) -> Result<()> {
        Client::post_permission(self, renter_id, file_id, permission).await
    }

    async fn delete_permission(
        &self,
        renter_id: &str,
        file_id: &str,
        user_id: &str,
    ) -> Result<()> {
        Client::delete_permission(self, renter_id, file_id, user_id).await
    }

    async fn get_shared_files(&self, renter_id: &str) -> Result<Vec<File>> {
        Client::get_shared_files(self, renter_id).await
    }

    async fn get_shared_file(&self, renter_id: &str, file_id: &str) -> Result<File> {
        Client::get_shared_file(self, renter_id, file_id).await
    }

    async fn get_contracts(&self, renter_id: &str) -> Result<Vec<Contract>> {
        Client::get_contracts(self, renter_id).await
    }

    async fn get_providers(&self) -> Result<Vec<ProviderInfo>> {
        Client::get_providers(self).await
    }
}
