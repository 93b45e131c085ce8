use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "upload_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub file_name: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i32,
    pub content_hash: String,
    pub status: String,
    pub final_key: Option<String>,
    pub assembly_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub last_activity_at: DateTimeWithTimeZone,
    pub expires_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::upload_chunks::Entity")]
    UploadChunks,
}

impl Related<super::upload_chunks::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UploadChunks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
