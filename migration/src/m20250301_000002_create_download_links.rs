use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

// One table per quality tier, identical layout.
const TIER_TABLES: [&str; 2] = ["download_link_normal", "download_link_best"];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in TIER_TABLES {
            let table = Alias::new(name);

            manager
                .create_table(
                    Table::create()
                        .table(table.clone())
                        .if_not_exists()
                        .col(integer(DownloadLink::MovieId).primary_key())
                        .col(string(DownloadLink::Filename))
                        .col(text(DownloadLink::Url))
                        .col(big_integer(DownloadLink::LastUpdated))
                        .foreign_key(
                            ForeignKey::create()
                                .name(format!("fk_{name}_movie"))
                                .from(table.clone(), DownloadLink::MovieId)
                                .to(Movie::Table, Movie::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name(format!("idx_{name}_last_updated"))
                        .table(table)
                        .col(DownloadLink::LastUpdated)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in TIER_TABLES.iter().rev() {
            manager.drop_table(Table::drop().table(Alias::new(*name)).to_owned()).await?;
        }
        Ok(())
    }
}

#[derive(DeriveIden)]
enum DownloadLink {
    MovieId,
    Filename,
    Url,
    LastUpdated,
}

#[derive(DeriveIden)]
enum Movie {
    Table,
    Id,
}
