/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Diesel schema for the job store.
//!
//! Timestamps are TEXT columns holding fixed-width RFC3339 UTC values so
//! SQL string comparison matches chronological order.

diesel::table! {
    jobs (id) {
        id -> Text,
        command -> Text,
        state -> Text,
        attempts -> Integer,
        max_retries -> Integer,
        created_at -> Text,
        updated_at -> Text,
        locked_by -> Nullable<Text>,
        locked_at -> Nullable<Text>,
        next_retry_at -> Nullable<Text>,
        error -> Nullable<Text>,
        output -> Nullable<Text>,
    }
}
