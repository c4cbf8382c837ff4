table! {
    files (id) {
        id -> Integer,
        filename -> Text,
        content_type -> Text,
        storage_key -> Text,
    }
}

table! {
    tokens (token) {
        token -> Text,
        username -> Text,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

table! {
    users (id) {
        id -> Integer,
        username -> Text,
        password_hash -> Text,
    }
}

allow_tables_to_appear_in_same_query!(
    files,
    tokens,
    users,
);
