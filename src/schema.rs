// Diesel table definitions for the metadata store.
// Kept by hand; the schema is bootstrapped by repository::migrations.

diesel::table! {
    jobs (id) {
        id -> Text,
        client_id -> Text,
        document_id -> Text,
        document_name -> Text,
        task_name -> Text,
        status -> Text,
        progress -> Double,
        engine -> Text,
        artifact_prefix -> Text,
        error_message -> Nullable<Text>,
        status_message -> Nullable<Text>,
        node_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    job_files (id) {
        id -> Text,
        job_id -> Text,
        file_type -> Text,
        object_key -> Text,
        file_name -> Text,
        file_size -> BigInt,
        metadata -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    job_settings (job_id) {
        job_id -> Text,
        text_model -> Text,
        table_model -> Text,
        image_model -> Text,
        stamp_model -> Text,
        is_correction_mode -> Integer,
    }
}

diesel::table! {
    tree_nodes (id) {
        id -> Text,
        parent_id -> Nullable<Text>,
        name -> Text,
        node_type -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

// No foreign key to jobs: node file registrations survive job deletion.
diesel::table! {
    node_files (id) {
        id -> Text,
        node_id -> Text,
        object_key -> Text,
        file_name -> Text,
        file_type -> Text,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(jobs, job_files, job_settings);
diesel::allow_tables_to_appear_in_same_query!(tree_nodes, node_files);
