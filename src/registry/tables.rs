// ABOUTME: The analytics table registry: accounts, files, finance and subscriptions
// ABOUTME: Declaration order places referenced tables before referencing ones

use super::ColumnKind::{Boolean, Decimal, Integer, Text, Timestamp};
use super::{ColumnSpec, FkAction, ForeignKeyConstraint, TableSpec, TimestampColumn};

const fn fk(
    name: &'static str,
    owning_table: &'static str,
    column: &'static str,
    referenced_table: &'static str,
) -> ForeignKeyConstraint {
    ForeignKeyConstraint {
        name,
        owning_table,
        column,
        referenced_table,
        referenced_column: "id",
        on_update: FkAction::NoAction,
        on_delete: FkAction::NoAction,
    }
}

const USER: &str = "account_management_user";
const USERFILE: &str = "file_management_userfile";
const WITHDRAW_METHOD: &str = "finance_management_withdrawmethod";
const SUBSCRIPTION_PLAN: &str = "subscription_management_subscriptionplan";

pub(super) const ANALYTICS_TABLES: &[TableSpec] = &[
    TableSpec {
        name: USER,
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("username", Text),
            ColumnSpec::new("country", Text),
            ColumnSpec::new("is_email_confirmed", Boolean),
            ColumnSpec::new("created_at", Timestamp),
            ColumnSpec::new("last_login", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS account_management_user (
            id SERIAL PRIMARY KEY,
            username VARCHAR(255),
            country VARCHAR(100),
            is_email_confirmed BOOLEAN,
            created_at TIMESTAMP,
            last_login TIMESTAMP
        )",
        foreign_keys: &[],
    },
    TableSpec {
        name: "account_management_referraltransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("referred_by_id", Integer),
            ColumnSpec::new("created_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS account_management_referraltransaction (
            id SERIAL PRIMARY KEY,
            referred_by_id INT,
            created_at TIMESTAMP
        )",
        foreign_keys: &[fk(
            "account_management_referraltransaction_referred_by_id_fkey",
            "account_management_referraltransaction",
            "referred_by_id",
            USER,
        )],
    },
    TableSpec {
        name: "account_management_followerstransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("followed_by_id", Integer),
            ColumnSpec::new("created_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS account_management_followerstransaction (
            id SERIAL PRIMARY KEY,
            followed_by_id INT,
            created_at TIMESTAMP
        )",
        foreign_keys: &[fk(
            "account_management_followerstransaction_followed_by_id_fkey",
            "account_management_followerstransaction",
            "followed_by_id",
            USER,
        )],
    },
    TableSpec {
        name: "file_management_category",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("category_name", Text),
            ColumnSpec::new("created_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS file_management_category (
            id SERIAL PRIMARY KEY,
            category_name VARCHAR(255),
            created_at TIMESTAMP
        )",
        foreign_keys: &[],
    },
    TableSpec {
        name: USERFILE,
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("user_id", Integer),
            ColumnSpec::new("category_id_id", Integer),
            ColumnSpec::new("created_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS file_management_userfile (
            id SERIAL PRIMARY KEY,
            user_id INT,
            category_id_id INT,
            created_at TIMESTAMP
        )",
        foreign_keys: &[fk(
            "file_management_userfile_user_id_fkey",
            USERFILE,
            "user_id",
            USER,
        )],
    },
    TableSpec {
        name: "file_management_filedownloadtransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("file_id", Integer),
            ColumnSpec::new("country_name", Text),
            ColumnSpec::new("counted", Boolean),
            ColumnSpec::new("created_at", Timestamp),
            ColumnSpec::new("browser_name", Text),
            ColumnSpec::new("device_name", Text),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS file_management_filedownloadtransaction (
            id SERIAL PRIMARY KEY,
            file_id INT,
            country_name VARCHAR(100),
            counted BOOL,
            created_at TIMESTAMP,
            browser_name VARCHAR(100),
            device_name VARCHAR(100)
        )",
        foreign_keys: &[fk(
            "file_management_filedownloadtransaction_file_id_fkey",
            "file_management_filedownloadtransaction",
            "file_id",
            USERFILE,
        )],
    },
    TableSpec {
        name: "file_management_filedownloadhistorytransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("file_id", Integer),
            ColumnSpec::new("created_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS file_management_filedownloadhistorytransaction (
            id SERIAL PRIMARY KEY,
            file_id INT,
            created_at TIMESTAMP
        )",
        foreign_keys: &[fk(
            "file_management_filedownloadhistorytransaction_file_id_fkey",
            "file_management_filedownloadhistorytransaction",
            "file_id",
            USERFILE,
        )],
    },
    TableSpec {
        name: "file_management_fileviewstransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("created_at", Timestamp),
            ColumnSpec::new("file_id", Integer),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS file_management_fileviewstransaction (
            id SERIAL PRIMARY KEY,
            created_at TIMESTAMP,
            file_id INT
        )",
        foreign_keys: &[fk(
            "file_management_fileviewstransaction_file_id_fkey",
            "file_management_fileviewstransaction",
            "file_id",
            USERFILE,
        )],
    },
    TableSpec {
        name: "finance_management_countrywiseearning",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("country_name", Text),
            ColumnSpec::new("earning_rate", Decimal),
            ColumnSpec::new("updated_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::UpdatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS finance_management_countrywiseearning (
            id SERIAL PRIMARY KEY,
            country_name VARCHAR(100),
            earning_rate DECIMAL,
            updated_at TIMESTAMP
        )",
        foreign_keys: &[],
    },
    TableSpec {
        name: "finance_management_userwallet",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("user_id", Integer),
            ColumnSpec::new("total_balance", Decimal),
            ColumnSpec::new("paid_balance", Decimal),
            ColumnSpec::new("updated_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::UpdatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS finance_management_userwallet (
            id SERIAL PRIMARY KEY,
            user_id INT,
            total_balance DECIMAL,
            paid_balance DECIMAL,
            updated_at TIMESTAMP
        )",
        foreign_keys: &[fk(
            "finance_management_userwallet_user_id_fkey",
            "finance_management_userwallet",
            "user_id",
            USER,
        )],
    },
    TableSpec {
        name: WITHDRAW_METHOD,
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("method_name", Text),
            ColumnSpec::new("created_at", Timestamp),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS finance_management_withdrawmethod (
            id SERIAL PRIMARY KEY,
            method_name VARCHAR(255),
            created_at TIMESTAMP
        )",
        foreign_keys: &[],
    },
    TableSpec {
        name: "finance_management_withdrawrequesttransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("user_id", Integer),
            ColumnSpec::new("withdraw_method_id", Integer),
            ColumnSpec::new("amount", Decimal),
            ColumnSpec::new("date_approved", Timestamp),
        ],
        timestamp_column: TimestampColumn::DateApproved,
        create_ddl: "CREATE TABLE IF NOT EXISTS finance_management_withdrawrequesttransaction (
            id SERIAL PRIMARY KEY,
            user_id INT,
            withdraw_method_id INT,
            amount DECIMAL,
            date_approved TIMESTAMP
        )",
        foreign_keys: &[
            fk(
                "finance_management_withdrawrequesttransaction_withdraw_method_id_fkey",
                "finance_management_withdrawrequesttransaction",
                "withdraw_method_id",
                WITHDRAW_METHOD,
            ),
            fk(
                "finance_management_withdrawrequesttransaction_user_id_fkey",
                "finance_management_withdrawrequesttransaction",
                "user_id",
                USER,
            ),
        ],
    },
    TableSpec {
        name: SUBSCRIPTION_PLAN,
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("subscription_name", Text),
            ColumnSpec::new("created_at", Timestamp),
            ColumnSpec::new("is_active", Boolean),
        ],
        timestamp_column: TimestampColumn::CreatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS subscription_management_subscriptionplan (
            id SERIAL PRIMARY KEY,
            subscription_name VARCHAR(255),
            created_at TIMESTAMP,
            is_active BOOLEAN
        )",
        foreign_keys: &[],
    },
    TableSpec {
        name: "subscription_management_subscriptiontransaction",
        columns: &[
            ColumnSpec::new("id", Integer),
            ColumnSpec::new("updated_at", Timestamp),
            ColumnSpec::new("subscription_plan_id", Integer),
            ColumnSpec::new("user_id", Integer),
            ColumnSpec::new("status", Text),
        ],
        timestamp_column: TimestampColumn::UpdatedAt,
        create_ddl: "CREATE TABLE IF NOT EXISTS subscription_management_subscriptiontransaction (
            id SERIAL PRIMARY KEY,
            updated_at TIMESTAMP,
            subscription_plan_id INT,
            user_id INT,
            status VARCHAR(255)
        )",
        foreign_keys: &[
            fk(
                "subscription_management_subscriptiontransaction_subscription_id_fkey",
                "subscription_management_subscriptiontransaction",
                "subscription_plan_id",
                SUBSCRIPTION_PLAN,
            ),
            fk(
                "subscription_management_subscriptiontransaction_user_id_fkey",
                "subscription_management_subscriptiontransaction",
                "user_id",
                USER,
            ),
        ],
    },
];
