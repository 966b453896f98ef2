//! MongoDB-backed [`PositionStore`], an alternative to `cdc-core`'s
//! file-backed store for deployments that already run a Mongo cluster for
//! the document store sink and would rather not manage a local volume.

use std::collections::HashMap;

use cdc_core::{PositionError, PositionStore};
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Collection};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PositionDocument {
    #[serde(rename = "_id")]
    stream_id: String,
    position: Vec<u8>,
    metadata: HashMap<String, String>,
}

pub struct MongoPositionStore {
    collection: Collection<Document>,
}

impl MongoPositionStore {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, PositionError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| PositionError::Backend(e.to_string()))?;
        let collection = client.database(database).collection(collection);
        Ok(Self { collection })
    }
}

#[async_trait::async_trait]
impl PositionStore for MongoPositionStore {
    async fn save(
        &self,
        stream_id: &str,
        position: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<(), PositionError> {
        let metadata_doc = mongodb::bson::to_bson(&metadata).map_err(|e| PositionError::Backend(e.to_string()))?;
        let update = doc! {
            "$set": {
                "position": position.to_vec(),
                "metadata": metadata_doc,
                "updated_at": mongodb::bson::DateTime::now(),
            },
            "$setOnInsert": { "created_at": mongodb::bson::DateTime::now() },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        self.collection
            .find_one_and_update(doc! {"_id": stream_id}, update, options)
            .await
            .map_err(|e| PositionError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, stream_id: &str) -> Result<(Vec<u8>, HashMap<String, String>), PositionError> {
        let found = self
            .collection
            .find_one(doc! {"_id": stream_id}, None)
            .await
            .map_err(|e| PositionError::Backend(e.to_string()))?
            .ok_or_else(|| PositionError::NotFound(stream_id.to_string()))?;

        let record: PositionDocument =
            mongodb::bson::from_document(found).map_err(|e| PositionError::Backend(e.to_string()))?;
        Ok((record.position, record.metadata))
    }

    async fn delete(&self, stream_id: &str) -> Result<(), PositionError> {
        self.collection
            .delete_one(doc! {"_id": stream_id}, None)
            .await
            .map_err(|e| PositionError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, Vec<u8>>, PositionError> {
        use futures::TryStreamExt;
        let mut cursor = self
            .collection
            .find(None, None)
            .await
            .map_err(|e| PositionError::Backend(e.to_string()))?;
        let mut out = HashMap::new();
        while let Some(found) = cursor.try_next().await.map_err(|e| PositionError::Backend(e.to_string()))? {
            if let Ok(record) = mongodb::bson::from_document::<PositionDocument>(found) {
                out.insert(record.stream_id, record.position);
            }
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<(), PositionError> {
        self.collection
            .estimated_document_count(None)
            .await
            .map(|_| ())
            .map_err(|e| PositionError::Backend(e.to_string()))
    }
}
