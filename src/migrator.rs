use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_checkout_sessions_table::Migration),
            Box::new(m20240101_000002_create_payments_table::Migration),
            Box::new(m20240101_000003_create_payment_attempts_table::Migration),
            Box::new(m20240101_000004_create_balance_transactions_table::Migration),
            Box::new(m20240101_000005_create_idempotency_records_table::Migration),
            Box::new(m20240101_000006_create_webhook_tables::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_checkout_sessions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_checkout_sessions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CheckoutSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutSessions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::StoreId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutSessions::PageId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutSessions::CustomerId).uuid().null())
                        .col(
                            ColumnDef::new(CheckoutSessions::CustomerEmail)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::Amount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::Currency)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::AllowCustomAmount)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::VariantChoices)
                                .json()
                                .null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::CouponId).uuid().null())
                        .col(
                            ColumnDef::new(CheckoutSessions::DiscountAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::CurrentPaymentId)
                                .uuid()
                                .null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::Status).string().not_null())
                        .col(ColumnDef::new(CheckoutSessions::LastError).string().null())
                        .col(
                            ColumnDef::new(CheckoutSessions::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::AbandonedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_store_id")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::StoreId)
                        .to_owned(),
                )
                .await?;

            // The expiry sweep scans by status and deadline.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_status_expires_at")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::Status)
                        .col(CheckoutSessions::ExpiresAt)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum CheckoutSessions {
        Table,
        Id,
        StoreId,
        PageId,
        CustomerId,
        CustomerEmail,
        Amount,
        Currency,
        AllowCustomAmount,
        VariantChoices,
        CouponId,
        DiscountAmount,
        CurrentPaymentId,
        Status,
        LastError,
        ExpiresAt,
        CompletedAt,
        AbandonedAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000002_create_payments_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Payments::SessionId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Payments::StoreId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Amount).decimal().not_null())
                        .col(ColumnDef::new(Payments::Currency).string().not_null())
                        .col(ColumnDef::new(Payments::Status).string().not_null())
                        .col(ColumnDef::new(Payments::PspIntentId).string().null())
                        .col(
                            ColumnDef::new(Payments::PlatformFee)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Payments::NetAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Payments::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_store_id")
                        .table(Payments::Table)
                        .col(Payments::StoreId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Payments {
        Table,
        Id,
        SessionId,
        StoreId,
        Amount,
        Currency,
        Status,
        PspIntentId,
        PlatformFee,
        NetAmount,
        CompletedAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000003_create_payment_attempts_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_payment_attempts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentAttempts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentAttempts::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentAttempts::PaymentId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentAttempts::AttemptNumber)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentAttempts::Status).string().not_null())
                        .col(ColumnDef::new(PaymentAttempts::PspIntentId).string().null())
                        .col(
                            ColumnDef::new(PaymentAttempts::RequiresAction)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(PaymentAttempts::RedirectUrl).string().null())
                        .col(ColumnDef::new(PaymentAttempts::FailureCode).string().null())
                        .col(
                            ColumnDef::new(PaymentAttempts::FailureMessage)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentAttempts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_attempts_payment_id")
                        .table(PaymentAttempts::Table)
                        .col(PaymentAttempts::PaymentId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentAttempts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum PaymentAttempts {
        Table,
        Id,
        PaymentId,
        AttemptNumber,
        Status,
        PspIntentId,
        RequiresAction,
        RedirectUrl,
        FailureCode,
        FailureMessage,
        CreatedAt,
    }
}

mod m20240101_000004_create_balance_transactions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_balance_transactions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(BalanceTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(BalanceTransactions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BalanceTransactions::StoreId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BalanceTransactions::TransactionType)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BalanceTransactions::Amount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BalanceTransactions::Currency)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BalanceTransactions::BalanceAfter)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(BalanceTransactions::PaymentId).uuid().null())
                        .col(ColumnDef::new(BalanceTransactions::RefundId).uuid().null())
                        .col(ColumnDef::new(BalanceTransactions::PayoutId).uuid().null())
                        .col(
                            ColumnDef::new(BalanceTransactions::Description)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(BalanceTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Balance reads scan the latest row per (store, currency).
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_balance_transactions_store_currency_created")
                        .table(BalanceTransactions::Table)
                        .col(BalanceTransactions::StoreId)
                        .col(BalanceTransactions::Currency)
                        .col(BalanceTransactions::CreatedAt)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(BalanceTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum BalanceTransactions {
        Table,
        Id,
        StoreId,
        TransactionType,
        Amount,
        Currency,
        BalanceAfter,
        PaymentId,
        RefundId,
        PayoutId,
        Description,
        CreatedAt,
    }
}

mod m20240101_000005_create_idempotency_records_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_idempotency_records_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(IdempotencyRecords::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(IdempotencyRecords::Key)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyRecords::RequestHash)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(IdempotencyRecords::StoreId).uuid().not_null())
                        .col(
                            ColumnDef::new(IdempotencyRecords::Endpoint)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyRecords::ResponseStatus)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyRecords::ResponseBody)
                                .json()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyRecords::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyRecords::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyRecords::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // The cleanup sweep deletes by deadline.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_idempotency_records_expires_at")
                        .table(IdempotencyRecords::Table)
                        .col(IdempotencyRecords::ExpiresAt)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(IdempotencyRecords::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum IdempotencyRecords {
        Table,
        Key,
        RequestHash,
        StoreId,
        Endpoint,
        ResponseStatus,
        ResponseBody,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000006_create_webhook_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_webhook_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(WebhookEndpoints::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WebhookEndpoints::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WebhookEndpoints::StoreId).uuid().not_null())
                        .col(ColumnDef::new(WebhookEndpoints::Url).string().not_null())
                        .col(ColumnDef::new(WebhookEndpoints::Secret).string().not_null())
                        .col(
                            ColumnDef::new(WebhookEndpoints::EventTypes)
                                .json()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WebhookEndpoints::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(WebhookEndpoints::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WebhookEndpoints::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_webhook_endpoints_store_id")
                        .table(WebhookEndpoints::Table)
                        .col(WebhookEndpoints::StoreId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WebhookEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WebhookEvents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WebhookEvents::StoreId).uuid().not_null())
                        .col(ColumnDef::new(WebhookEvents::EventType).string().not_null())
                        .col(
                            ColumnDef::new(WebhookEvents::ResourceType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WebhookEvents::ResourceId).string().not_null())
                        .col(ColumnDef::new(WebhookEvents::Payload).json().not_null())
                        .col(
                            ColumnDef::new(WebhookEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_webhook_events_store_id")
                        .table(WebhookEvents::Table)
                        .col(WebhookEvents::StoreId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WebhookDeliveries::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WebhookDeliveries::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WebhookDeliveries::EventId).uuid().not_null())
                        .col(
                            ColumnDef::new(WebhookDeliveries::EndpointId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WebhookDeliveries::Status).string().not_null())
                        .col(
                            ColumnDef::new(WebhookDeliveries::AttemptNumber)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(WebhookDeliveries::NextAttemptAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(WebhookDeliveries::ResponseStatus)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(WebhookDeliveries::ResponseBody)
                                .string()
                                .null(),
                        )
                        .col(ColumnDef::new(WebhookDeliveries::LastError).string().null())
                        .col(
                            ColumnDef::new(WebhookDeliveries::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WebhookDeliveries::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // The dispatcher claims due rows by status and deadline.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_webhook_deliveries_status_next_attempt")
                        .table(WebhookDeliveries::Table)
                        .col(WebhookDeliveries::Status)
                        .col(WebhookDeliveries::NextAttemptAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_webhook_deliveries_endpoint_id")
                        .table(WebhookDeliveries::Table)
                        .col(WebhookDeliveries::EndpointId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WebhookDeliveries::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(WebhookEndpoints::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum WebhookEndpoints {
        Table,
        Id,
        StoreId,
        Url,
        Secret,
        EventTypes,
        Active,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum WebhookEvents {
        Table,
        Id,
        StoreId,
        EventType,
        ResourceType,
        ResourceId,
        Payload,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub enum WebhookDeliveries {
        Table,
        Id,
        EventId,
        EndpointId,
        Status,
        AttemptNumber,
        NextAttemptAt,
        ResponseStatus,
        ResponseBody,
        LastError,
        CreatedAt,
        UpdatedAt,
    }
}
